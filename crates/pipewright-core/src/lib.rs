pub mod catalog;
pub mod config;
pub mod error;
pub mod event;
pub mod node;
pub mod pipeline;
pub mod run;
pub mod traits;

pub use catalog::{Capability, NodeCategory, NodeTypeDescriptor};
pub use config::AppConfig;
pub use error::{PipelineError, Result};
pub use event::{EventBus, PipelineEvent};
pub use node::{NodeConfig, NodeState, NodeStatus, PipelineNode};
pub use pipeline::{Pipeline, PipelineEdge, PipelineStatus};
pub use run::{
    NodeExecutionResult, NodeRunResult, PipelineRun, ResultStatus, RunReport, RunStatus,
    TriggerDescriptor,
};
