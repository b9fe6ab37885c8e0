use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::AppConfig;
use weft_core::types::{InstanceId, WorkflowEvent, WorkflowId, WorkflowInstance};

use weft_engine::dsl::{self, DocumentFormat};
use weft_engine::{Collaborators, HandlerRegistry, RunLogger, WorkflowEngine};
use weft_llm::ConfiguredRouter;
use weft_store::SqliteStore;

#[derive(Parser)]
#[command(name = "weft", version, about = "Workflow orchestration engine for Dify-style graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a workflow document (Dify YAML or JSON)
    Import {
        /// Path to the document
        path: PathBuf,
        /// Workflow name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Check a workflow document without storing it
    Validate {
        /// Path to the document
        path: PathBuf,
    },
    /// Run a stored workflow and wait for it to finish
    Run {
        /// Workflow ID
        workflow_id: String,
        /// Inputs as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// List stored workflows
    Workflows,
    /// List workflow instances, most recent first
    Instances {
        /// Only instances of this workflow
        #[arg(long)]
        workflow: Option<String>,
        /// Maximum number of instances to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show one instance record
    Show {
        /// Instance ID
        instance_id: String,
    },
    /// Show the node traces of one instance
    Traces {
        /// Instance ID
        instance_id: String,
    },
    /// Cancel a RUNNING instance
    Cancel {
        /// Instance ID
        instance_id: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)?;
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
    }

    // Validation needs no store
    if let Commands::Validate { path } = &cli.command {
        return validate(&config, path);
    }

    if let Commands::Config = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let db_path = config.database_path();
    let store = Arc::new(SqliteStore::open(&db_path)?);
    info!(path = %db_path.display(), "Store opened");
    let engine = Arc::new(build_engine(&config, store.clone()));

    // JSONL run log, when configured
    let log_cancel = CancellationToken::new();
    let log_task = config.log_dir().map(|dir| {
        let level = config.log.as_ref().map(|l| l.level).unwrap_or(1);
        let logger = RunLogger::new(dir, level);
        tokio::spawn(logger.run(engine.events(), log_cancel.clone()))
    });

    let result = dispatch(cli.command, &engine, &store).await;

    log_cancel.cancel();
    if let Some(task) = log_task {
        task.await.ok();
    }
    result
}

fn build_engine(config: &AppConfig, store: Arc<SqliteStore>) -> WorkflowEngine {
    let router = ConfiguredRouter::from_config(config);
    let mut collaborators =
        Collaborators::new().with_default_model(config.engine.default_model.clone());
    if router.is_empty() {
        warn!("No models configured, llm nodes are unavailable");
    } else {
        info!(models = ?router.models(), "Model router ready");
        collaborators = collaborators.with_models(Arc::new(router));
    }

    let registry = HandlerRegistry::with_builtins(&collaborators);
    info!(handlers = ?registry.list(), "Handler registry ready");

    WorkflowEngine::new(store.clone(), store.clone(), registry, config.engine.clone())
        .with_trace_sink(store)
}

fn validate(config: &AppConfig, path: &Path) -> anyhow::Result<()> {
    let graph = dsl::load_file(path)?;
    let router = ConfiguredRouter::from_config(config);
    let mut collaborators = Collaborators::new();
    if !router.is_empty() {
        collaborators = collaborators.with_models(Arc::new(router));
    }
    let registry = HandlerRegistry::with_builtins(&collaborators);
    let executor = weft_engine::GraphExecutor::new(Arc::new(registry));
    executor.validate(&graph)?;
    println!(
        "OK: {} nodes, {} edges, start: {}",
        graph.nodes.len(),
        graph.edges.len(),
        graph
            .start_nodes()
            .iter()
            .map(|n| n.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

async fn dispatch(
    command: Commands,
    engine: &Arc<WorkflowEngine>,
    store: &SqliteStore,
) -> anyhow::Result<()> {
    match command {
        Commands::Import { path, name } => {
            let text = std::fs::read_to_string(&path)?;
            let doc = dsl::parse_document(&text, DocumentFormat::from_path(&path))?;
            let name = name.unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "workflow".to_string())
            });
            let workflow = engine.import(&doc, name, std::env::var("USER").ok()).await?;
            println!("{}", workflow.id);
        }
        Commands::Run { workflow_id, input } => {
            let inputs: serde_json::Value = serde_json::from_str(&input)?;
            let instance = run_to_completion(engine, &WorkflowId::from_str(&workflow_id), inputs).await?;
            print_instance(&instance)?;
        }
        Commands::Workflows => {
            let workflows = engine.list_workflows().await?;
            if workflows.is_empty() {
                println!("No workflows.");
            }
            for wf in workflows {
                println!(
                    "{}  {:<24}  {:<8}  v{}  {} nodes",
                    wf.id,
                    wf.name,
                    wf.status.as_str(),
                    wf.version,
                    wf.graph.nodes.len()
                );
            }
        }
        Commands::Instances { workflow, limit } => {
            let workflow = workflow.map(|w| WorkflowId::from_str(&w));
            let instances = engine.list_instances(workflow.as_ref(), limit).await?;
            if instances.is_empty() {
                println!("No instances.");
            }
            for inst in instances {
                println!(
                    "{}  {:<9}  {}  {}",
                    inst.id,
                    inst.status.as_str(),
                    inst.started_at.format("%Y-%m-%d %H:%M:%S"),
                    inst.duration_ms
                        .map(|d| format!("{}ms", d))
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
        Commands::Show { instance_id } => {
            let instance = engine.get_instance(&InstanceId::from_str(&instance_id)).await?;
            print_instance(&instance)?;
        }
        Commands::Traces { instance_id } => {
            let traces = store.list_traces(&InstanceId::from_str(&instance_id))?;
            if traces.is_empty() {
                println!("No traces.");
            }
            for t in traces {
                println!(
                    "{:<20}  {:<20}  {:<8}  {}{}",
                    t.step_id,
                    t.node_type,
                    t.status.as_str(),
                    t.duration_ms
                        .map(|d| format!("{}ms", d))
                        .unwrap_or_else(|| "-".to_string()),
                    t.error_message
                        .map(|m| format!("  {}", m))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Cancel { instance_id } => {
            let changed = engine.cancel(&InstanceId::from_str(&instance_id)).await?;
            println!("{}", if changed { "Cancelled." } else { "Instance already finished." });
        }
        Commands::Validate { .. } | Commands::Config | Commands::Completions { .. } => {}
    }
    Ok(())
}

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Run on a background task so Ctrl-C can cancel between nodes.
async fn run_to_completion(
    engine: &Arc<WorkflowEngine>,
    workflow_id: &WorkflowId,
    inputs: serde_json::Value,
) -> anyhow::Result<WorkflowInstance> {
    let mut rx = engine.events().subscribe();
    let id = engine
        .spawn(workflow_id, inputs, std::env::var("USER").ok(), Some("cli".to_string()))
        .await?;
    info!(instance_id = %id, "Instance started");

    let mut interrupted = false;
    let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                // Another process may have finished the record
                if engine.get_instance(&id).await?.status.is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!(instance_id = %id, "Interrupted, cancelling");
                engine.cancel(&id).await?;
                interrupted = true;
            }
            event = rx.recv() => match event {
                Ok(WorkflowEvent::WorkflowCompleted { instance_id, .. })
                | Ok(WorkflowEvent::WorkflowFailed { instance_id, .. })
                    if instance_id == id => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if engine.get_instance(&id).await?.status.is_terminal() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    Ok(engine.get_instance(&id).await?)
}

fn print_instance(instance: &WorkflowInstance) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(instance)?);
    Ok(())
}
