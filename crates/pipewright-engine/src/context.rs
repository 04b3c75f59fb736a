use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pipewright_core::config::EngineConfig;
use pipewright_core::error::{PipelineError, Result};
use pipewright_core::traits::{ExpressionEvaluator, IsolatedExecutor, RemoteCall, SystemEvents};

use crate::evaluator::SimpleEvaluator;

/// Externally supplied operations available to executors.
///
/// Every field except the evaluator is optional; an executor that needs a
/// missing capability reports a failure instead of running.
#[derive(Clone)]
pub struct Capabilities {
    pub remote: Option<Arc<dyn RemoteCall>>,
    pub isolated: Option<Arc<dyn IsolatedExecutor>>,
    pub system_events: Option<Arc<dyn SystemEvents>>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
}

impl Capabilities {
    /// No remote capabilities, [`SimpleEvaluator`] for expressions.
    pub fn new() -> Self {
        Self {
            remote: None,
            isolated: None,
            system_events: None,
            evaluator: Arc::new(SimpleEvaluator),
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteCall>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_isolated(mut self, isolated: Arc<dyn IsolatedExecutor>) -> Self {
        self.isolated = Some(isolated);
        self
    }

    pub fn with_system_events(mut self, events: Arc<dyn SystemEvents>) -> Self {
        self.system_events = Some(events);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn remote(&self) -> Result<&Arc<dyn RemoteCall>> {
        self.remote
            .as_ref()
            .ok_or_else(|| PipelineError::CapabilityUnavailable("remote call".into()))
    }

    pub fn isolated(&self) -> Result<&Arc<dyn IsolatedExecutor>> {
        self.isolated
            .as_ref()
            .ok_or_else(|| PipelineError::CapabilityUnavailable("isolated execution".into()))
    }

    pub fn system_events(&self) -> Result<&Arc<dyn SystemEvents>> {
        self.system_events
            .as_ref()
            .ok_or_else(|| PipelineError::CapabilityUnavailable("system events".into()))
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("remote", &self.remote.is_some())
            .field("isolated", &self.isolated.is_some())
            .field("system_events", &self.system_events.is_some())
            .finish()
    }
}

/// Tunables executors read at run time.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub poll_interval: Duration,
    pub code_timeout_secs: u64,
    pub agent_timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ExecutorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            code_timeout_secs: config.default_code_timeout_secs,
            agent_timeout_secs: config.default_agent_timeout_secs,
        }
    }
}

/// Per-run context handed to every executor invocation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub pipeline_id: String,
    pub run_id: String,
    pub capabilities: Capabilities,
    pub settings: ExecutorSettings,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(pipeline_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            run_id: run_id.into(),
            capabilities: Capabilities::default(),
            settings: ExecutorSettings::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
