pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, WeftError};
pub use event::EventBus;
pub use graph::{Graph, GraphEdge, GraphNode};
pub use types::*;
