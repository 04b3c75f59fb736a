//! Node type catalog: the static table of executable node kinds.
//!
//! The run engine consults this table to decide how a node is dispatched
//! (trigger passthrough, engine-native loop, or executor), and external
//! tooling uses it to enumerate what can be placed in a pipeline.

use serde::Serialize;

/// Broad grouping of node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    Trigger,
    Processing,
    Action,
}

impl std::fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trigger => write!(f, "trigger"),
            Self::Processing => write!(f, "processing"),
            Self::Action => write!(f, "action"),
        }
    }
}

/// An externally supplied operation a node type depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    RemoteCall,
    IsolatedExecution,
    SystemEvents,
    Evaluator,
}

/// Catalog entry describing one node type.
#[derive(Debug, Clone, Serialize)]
pub struct NodeTypeDescriptor {
    pub id: &'static str,
    pub category: NodeCategory,
    pub label: &'static str,
    pub description: &'static str,
    pub inputs: &'static [&'static str],
    pub outputs: &'static [&'static str],
    pub requires: &'static [Capability],
}

impl NodeTypeDescriptor {
    /// Whether `handle` is one of this type's declared output handles.
    pub fn has_output(&self, handle: &str) -> bool {
        self.outputs.contains(&handle)
    }
}

const NONE: &[&str] = &[];
const IN: &[&str] = &["in"];
const OUT: &[&str] = &["out"];

static NODE_TYPES: &[NodeTypeDescriptor] = &[
    // ── Triggers ────────────────────────────────────────────────
    NodeTypeDescriptor {
        id: "cron",
        category: NodeCategory::Trigger,
        label: "Schedule",
        description: "Start the pipeline on a cron schedule.",
        inputs: NONE,
        outputs: OUT,
        requires: &[],
    },
    NodeTypeDescriptor {
        id: "webhook",
        category: NodeCategory::Trigger,
        label: "Webhook",
        description: "Start the pipeline when an HTTP request hits a path.",
        inputs: NONE,
        outputs: OUT,
        requires: &[],
    },
    NodeTypeDescriptor {
        id: "task_event",
        category: NodeCategory::Trigger,
        label: "Task event",
        description: "Start the pipeline when a matching task event occurs.",
        inputs: NONE,
        outputs: OUT,
        requires: &[],
    },
    NodeTypeDescriptor {
        id: "manual",
        category: NodeCategory::Trigger,
        label: "Manual",
        description: "Start the pipeline by hand.",
        inputs: NONE,
        outputs: OUT,
        requires: &[],
    },
    // ── Processing ──────────────────────────────────────────────
    NodeTypeDescriptor {
        id: "agent",
        category: NodeCategory::Processing,
        label: "Agent",
        description: "Run an agent turn with the given prompt and skills.",
        inputs: IN,
        outputs: OUT,
        requires: &[Capability::IsolatedExecution],
    },
    NodeTypeDescriptor {
        id: "app",
        category: NodeCategory::Processing,
        label: "App",
        description: "Invoke an installed app with a prompt.",
        inputs: IN,
        outputs: OUT,
        requires: &[Capability::RemoteCall],
    },
    NodeTypeDescriptor {
        id: "condition",
        category: NodeCategory::Processing,
        label: "Condition",
        description: "Branch on an expression evaluated against the input.",
        inputs: IN,
        outputs: &["true", "false"],
        requires: &[Capability::Evaluator],
    },
    NodeTypeDescriptor {
        id: "approval",
        category: NodeCategory::Processing,
        label: "Approval",
        description: "Pause until a human approves or denies.",
        inputs: IN,
        outputs: &["approved", "denied"],
        requires: &[Capability::RemoteCall],
    },
    NodeTypeDescriptor {
        id: "loop",
        category: NodeCategory::Processing,
        label: "Loop",
        description: "Repeat the body branch up to a maximum number of iterations.",
        inputs: IN,
        outputs: &["body", "done"],
        requires: &[Capability::Evaluator],
    },
    NodeTypeDescriptor {
        id: "code",
        category: NodeCategory::Processing,
        label: "Code",
        description: "Write and execute code to accomplish a task.",
        inputs: IN,
        outputs: OUT,
        requires: &[Capability::IsolatedExecution],
    },
    // ── Actions ─────────────────────────────────────────────────
    NodeTypeDescriptor {
        id: "notify",
        category: NodeCategory::Action,
        label: "Notify",
        description: "Send a templated notification to one or more channels.",
        inputs: IN,
        outputs: OUT,
        requires: &[Capability::RemoteCall],
    },
    NodeTypeDescriptor {
        id: "output",
        category: NodeCategory::Action,
        label: "Output",
        description: "Format the input as JSON, markdown or text.",
        inputs: IN,
        outputs: OUT,
        requires: &[],
    },
];

/// Look up a node type by id.
pub fn lookup(type_id: &str) -> Option<&'static NodeTypeDescriptor> {
    NODE_TYPES.iter().find(|d| d.id == type_id)
}

/// All catalog entries, in declaration order.
pub fn all() -> &'static [NodeTypeDescriptor] {
    NODE_TYPES
}

/// Catalog entries for one category.
pub fn by_category(category: NodeCategory) -> impl Iterator<Item = &'static NodeTypeDescriptor> {
    NODE_TYPES.iter().filter(move |d| d.category == category)
}

/// Whether a type id names a trigger.
pub fn is_trigger(type_id: &str) -> bool {
    lookup(type_id).is_some_and(|d| d.category == NodeCategory::Trigger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<_> = all().iter().map(|d| d.id).collect();
        assert_eq!(ids.len(), all().len());
    }

    #[test]
    fn lookup_known_and_unknown() {
        let d = lookup("approval").unwrap();
        assert_eq!(d.category, NodeCategory::Processing);
        assert!(d.has_output("approved"));
        assert!(d.has_output("denied"));
        assert!(!d.has_output("out"));
        assert!(lookup("teleport").is_none());
    }

    #[test]
    fn triggers_have_no_inputs() {
        let triggers: Vec<_> = by_category(NodeCategory::Trigger).collect();
        assert_eq!(triggers.len(), 4);
        assert!(triggers.iter().all(|d| d.inputs.is_empty()));
        assert!(is_trigger("cron"));
        assert!(!is_trigger("notify"));
    }

    #[test]
    fn condition_ports_match_handles() {
        let d = lookup("condition").unwrap();
        assert_eq!(d.outputs, &["true", "false"]);
    }
}
