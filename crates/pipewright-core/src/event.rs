use serde::Serialize;

use crate::run::RunStatus;
use crate::traits::EventSink;

/// Lifecycle event emitted by the run engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        pipeline_id: String,
        run_id: String,
        trigger: String,
    },
    NodeStarted {
        pipeline_id: String,
        run_id: String,
        node_id: String,
        node_type: String,
        attempt: u32,
    },
    NodeCompleted {
        pipeline_id: String,
        run_id: String,
        node_id: String,
        output_handle: Option<String>,
        duration_ms: u64,
    },
    NodeFailed {
        pipeline_id: String,
        run_id: String,
        node_id: String,
        error: String,
        duration_ms: u64,
    },
    NodeSkipped {
        pipeline_id: String,
        run_id: String,
        node_id: String,
        reason: Option<String>,
    },
    RunCompleted {
        pipeline_id: String,
        run_id: String,
        status: RunStatus,
        error: Option<String>,
        duration_ms: u64,
    },
}

impl PipelineEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::NodeSkipped { run_id, .. }
            | Self::RunCompleted { run_id, .. } => run_id,
        }
    }

    /// The node this event is about, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeFailed { node_id, .. }
            | Self::NodeSkipped { node_id, .. } => Some(node_id),
            Self::RunStarted { .. } | Self::RunCompleted { .. } => None,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: PipelineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: PipelineEvent) {
        self.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(run: &str) -> PipelineEvent {
        PipelineEvent::RunStarted {
            pipeline_id: "p".into(),
            run_id: run.into(),
            trigger: "manual".into(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(started("r1"));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.run_id(), "r1");
        assert!(ev.node_id().is_none());
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        for i in 0..10 {
            bus.publish(started(&i.to_string()));
        }
    }

    #[test]
    fn serializes_with_type_tag() {
        let ev = PipelineEvent::NodeSkipped {
            pipeline_id: "p".into(),
            run_id: "r".into(),
            node_id: "gate".into(),
            reason: Some("approval timed out".into()),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "node_skipped");
        assert_eq!(v["node_id"], "gate");
    }
}
