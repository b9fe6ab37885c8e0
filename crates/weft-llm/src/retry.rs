use futures::future::BoxFuture;
use tracing::warn;

use weft_core::config::RetryConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::CompletionProvider;
use weft_core::types::CompletionParams;

/// A completion provider that retries transient upstream failures.
pub struct RetryingProvider {
    inner: Box<dyn CompletionProvider>,
    retry_config: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: Box<dyn CompletionProvider>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &WeftError) -> bool {
    match e {
        WeftError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

impl CompletionProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn complete(
        &self,
        model: &str,
        prompt: &str,
        params: &CompletionParams,
    ) -> BoxFuture<'_, Result<String>> {
        let model = model.to_string();
        let prompt = prompt.to_string();
        let params = params.clone();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.complete(&model, &prompt, &params).await {
                    Ok(text) => return Ok(text),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = self.retry_config.backoff(attempt);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying completion request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Flaky {
        calls: Arc<AtomicU32>,
        fail_times: u32,
        error: fn() -> WeftError,
    }

    impl CompletionProvider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn complete(
            &self,
            _model: &str,
            _prompt: &str,
            _params: &CompletionParams,
        ) -> BoxFuture<'_, Result<String>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_times {
                    Err((self.error)())
                } else {
                    Ok("ok".to_string())
                }
            })
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = RetryingProvider::new(
            Box::new(Flaky {
                calls: calls.clone(),
                fail_times: 2,
                error: || WeftError::LlmRequest("HTTP 503: busy".into()),
            }),
            fast_retry(3),
        );
        let out = provider
            .complete("m", "p", &CompletionParams::default())
            .await
            .unwrap();
        assert_eq!(out, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = RetryingProvider::new(
            Box::new(Flaky {
                calls: calls.clone(),
                fail_times: 10,
                error: || WeftError::LlmRequest("HTTP 429: slow down".into()),
            }),
            fast_retry(2),
        );
        assert!(provider
            .complete("m", "p", &CompletionParams::default())
            .await
            .is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = RetryingProvider::new(
            Box::new(Flaky {
                calls: calls.clone(),
                fail_times: 10,
                error: || WeftError::LlmRequest("HTTP 401: bad key".into()),
            }),
            fast_retry(5),
        );
        assert!(provider
            .complete("m", "p", &CompletionParams::default())
            .await
            .is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
