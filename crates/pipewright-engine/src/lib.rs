pub mod context;
pub mod engine;
pub mod evaluator;
pub mod executors;
pub mod registry;
pub mod scheduler;
pub mod template;

pub use context::{Capabilities, ExecutionContext, ExecutorSettings};
pub use engine::{RunEngine, RunHandle, LOOP_DONE_HANDLE};
pub use evaluator::SimpleEvaluator;
pub use executors::output::format_output;
pub use registry::{execute_guarded, ExecutorRegistry, NodeExecutor};
pub use scheduler::CronScheduler;
