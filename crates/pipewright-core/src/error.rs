use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    // Executor-side errors (always folded into a failure result)
    #[error("Invalid node configuration: {0}")]
    ConfigValidation(String),

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("External call failed: {method}: {message}")]
    ExternalCall { method: String, message: String },

    #[error("Format error: {0}")]
    Format(String),

    #[error("Timed out after {0}s")]
    TimeoutExceeded(u64),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Cancelled")]
    Cancelled,

    // Structural errors (fail a run before dispatch)
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Invalid pipeline graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid lifecycle transition: {0}")]
    Lifecycle(String),

    #[error("Run task failed: {0}")]
    RunTask(String),

    // Storage errors
    #[error("Run log error: {0}")]
    Storage(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn external(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalCall {
            method: method.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_call_message() {
        let e = PipelineError::external("tasks.create", "connection refused");
        assert_eq!(
            e.to_string(),
            "External call failed: tasks.create: connection refused"
        );
    }

    #[test]
    fn json_error_converts() {
        let err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let e: PipelineError = err.into();
        assert!(matches!(e, PipelineError::Json(_)));
    }
}
