use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{self, NodeTypeDescriptor};
use crate::error::{PipelineError, Result};

/// A node in a pipeline graph.
///
/// The wire form is `{id, type, label, config, retries, state}`; `type` and
/// `config` are folded into the closed [`NodeConfig`] variant on
/// deserialization, so a node with an unknown type or a malformed config
/// never makes it into memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct PipelineNode {
    pub id: String,
    pub label: String,
    pub config: NodeConfig,
    /// Engine re-dispatch budget when the executor reports `failure`.
    pub retries: u32,
    pub state: NodeState,
}

impl PipelineNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            config,
            retries: 0,
            state: NodeState::default(),
        }
    }

    /// Set the retry budget.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// The catalog type id of this node.
    pub fn node_type(&self) -> &'static str {
        self.config.type_id()
    }

    /// The catalog entry for this node's type.
    pub fn descriptor(&self) -> Option<&'static NodeTypeDescriptor> {
        catalog::lookup(self.node_type())
    }

    pub fn is_trigger(&self) -> bool {
        catalog::is_trigger(self.node_type())
    }
}

#[derive(Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default, skip_serializing_if = "is_zero")]
    retries: u32,
    #[serde(default)]
    state: NodeState,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl TryFrom<RawNode> for PipelineNode {
    type Error = PipelineError;

    fn try_from(raw: RawNode) -> Result<Self> {
        let config = NodeConfig::from_parts(&raw.node_type, raw.config).map_err(|e| {
            PipelineError::ConfigValidation(format!("node '{}': {}", raw.id, e))
        })?;
        Ok(Self {
            id: raw.id,
            label: raw.label,
            config,
            retries: raw.retries,
            state: raw.state,
        })
    }
}

impl From<PipelineNode> for RawNode {
    fn from(node: PipelineNode) -> Self {
        let (node_type, config) = node.config.to_parts();
        Self {
            id: node.id,
            node_type: node_type.to_string(),
            label: node.label,
            config,
            retries: node.retries,
            state: node.state,
        }
    }
}

/// Per-type node configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfig {
    Cron(CronTrigger),
    Webhook(WebhookTrigger),
    TaskEvent(TaskEventTrigger),
    Manual(ManualTrigger),
    Agent(AgentStep),
    App(AppStep),
    Condition(ConditionStep),
    Approval(ApprovalStep),
    Loop(LoopStep),
    Code(CodeStep),
    Notify(NotifyAction),
    Output(OutputAction),
}

impl NodeConfig {
    pub fn type_id(&self) -> &'static str {
        match self {
            Self::Cron(_) => "cron",
            Self::Webhook(_) => "webhook",
            Self::TaskEvent(_) => "task_event",
            Self::Manual(_) => "manual",
            Self::Agent(_) => "agent",
            Self::App(_) => "app",
            Self::Condition(_) => "condition",
            Self::Approval(_) => "approval",
            Self::Loop(_) => "loop",
            Self::Code(_) => "code",
            Self::Notify(_) => "notify",
            Self::Output(_) => "output",
        }
    }

    /// Build a config from a type id and its JSON body, validating the
    /// fields that can be checked without running the node.
    pub fn from_parts(type_id: &str, config: serde_json::Value) -> Result<Self> {
        let config = if config.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            config
        };

        let parsed = match type_id {
            "cron" => Self::Cron(serde_json::from_value(config)?),
            "webhook" => Self::Webhook(serde_json::from_value(config)?),
            "task_event" => Self::TaskEvent(serde_json::from_value(config)?),
            "manual" => Self::Manual(serde_json::from_value(config)?),
            "agent" => Self::Agent(serde_json::from_value(config)?),
            "app" => Self::App(serde_json::from_value(config)?),
            "condition" => Self::Condition(serde_json::from_value(config)?),
            "approval" => Self::Approval(serde_json::from_value(config)?),
            "loop" => Self::Loop(serde_json::from_value(config)?),
            "code" => Self::Code(serde_json::from_value(config)?),
            "notify" => Self::Notify(serde_json::from_value(config)?),
            "output" => Self::Output(serde_json::from_value(config)?),
            other => return Err(PipelineError::UnknownNodeType(other.to_string())),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Split back into the wire form.
    pub fn to_parts(&self) -> (&'static str, serde_json::Value) {
        let value = match self {
            Self::Cron(c) => serde_json::to_value(c),
            Self::Webhook(c) => serde_json::to_value(c),
            Self::TaskEvent(c) => serde_json::to_value(c),
            Self::Manual(c) => serde_json::to_value(c),
            Self::Agent(c) => serde_json::to_value(c),
            Self::App(c) => serde_json::to_value(c),
            Self::Condition(c) => serde_json::to_value(c),
            Self::Approval(c) => serde_json::to_value(c),
            Self::Loop(c) => serde_json::to_value(c),
            Self::Code(c) => serde_json::to_value(c),
            Self::Notify(c) => serde_json::to_value(c),
            Self::Output(c) => serde_json::to_value(c),
        };
        // Plain derive(Serialize) structs cannot fail to serialize.
        (self.type_id(), value.unwrap_or_default())
    }

    /// Structural checks. Required-but-empty strings (approval message,
    /// notify template, ...) are left for the executor so drafts can be saved.
    fn validate(&self) -> Result<()> {
        match self {
            Self::Cron(c) => {
                c.parse_schedule()?;
            }
            Self::Webhook(w) if w.path.trim().is_empty() => {
                return Err(PipelineError::ConfigValidation(
                    "webhook path must not be empty".into(),
                ));
            }
            Self::Loop(l) if l.max_iterations == 0 => {
                return Err(PipelineError::ConfigValidation(
                    "loop maxIterations must be at least 1".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

// ── Trigger configs ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronTrigger {
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl CronTrigger {
    /// Parse the schedule. Five-field expressions get a leading seconds field.
    pub fn parse_schedule(&self) -> Result<cron::Schedule> {
        let expr = self.schedule.trim();
        let expr = if expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        cron::Schedule::from_str(&expr).map_err(|e| {
            PipelineError::ConfigValidation(format!(
                "invalid cron schedule '{}': {}",
                self.schedule, e
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTrigger {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEventTrigger {
    pub event_filter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

// ── Processing configs ──────────────────────────────────────────────

/// Where an agent or app turn runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionTarget {
    /// A fresh, isolated session per invocation.
    #[default]
    Isolated,
    /// The host's main session.
    Main,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStep {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub credentials: Vec<String>,
    #[serde(default)]
    pub session_target: SessionTarget,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStep {
    pub app_id: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub session_target: SessionTarget,
    #[serde(default = "default_lifecycle")]
    pub lifecycle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

fn default_lifecycle() -> String {
    "ephemeral".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionStep {
    #[serde(default)]
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_label: Option<String>,
}

/// What an approval gate does when its deadline passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutAction {
    #[default]
    Deny,
    Skip,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStep {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub timeout_action: TimeoutAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStep {
    pub max_iterations: u32,
    /// Stop condition, checked against each iteration's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeStep {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

// ── Action configs ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyAction {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Markdown,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputAction {
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

// ── Run-time state ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
    Skipped,
    Waiting,
}

/// Mutable run-time state of a node. Only the run engine writes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<serde_json::Value>,
    #[serde(default)]
    pub retry_count: u32,
}
