//! Node and pipeline builders for tests.

use pipewright_core::node::{
    AgentStep, AppStep, ApprovalStep, CodeStep, ConditionStep, LoopStep, ManualTrigger,
    NodeConfig, NotifyAction, OutputAction, OutputFormat, PipelineNode, SessionTarget,
    TimeoutAction,
};
use pipewright_core::pipeline::{Pipeline, PipelineEdge};

pub fn manual(id: &str) -> PipelineNode {
    PipelineNode::new(id, id, NodeConfig::Manual(ManualTrigger::default()))
}

pub fn condition(id: &str, expression: &str) -> PipelineNode {
    PipelineNode::new(
        id,
        id,
        NodeConfig::Condition(ConditionStep {
            expression: expression.into(),
            true_label: None,
            false_label: None,
        }),
    )
}

pub fn output(id: &str, format: OutputFormat) -> PipelineNode {
    PipelineNode::new(
        id,
        id,
        NodeConfig::Output(OutputAction {
            format,
            destination: None,
            path: None,
        }),
    )
}

pub fn approval(id: &str, timeout_sec: Option<u64>, action: TimeoutAction) -> PipelineNode {
    PipelineNode::new(
        id,
        id,
        NodeConfig::Approval(ApprovalStep {
            message: format!("Approve {id}?"),
            approver_ids: None,
            timeout_sec,
            timeout_action: action,
        }),
    )
}

pub fn notify(id: &str, channels: &[&str], template: &str) -> PipelineNode {
    PipelineNode::new(
        id,
        id,
        NodeConfig::Notify(NotifyAction {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            template: template.into(),
            priority: None,
        }),
    )
}

pub fn code(id: &str, description: &str) -> PipelineNode {
    PipelineNode::new(
        id,
        id,
        NodeConfig::Code(CodeStep {
            description: description.into(),
            language: None,
            max_retries: None,
            timeout: None,
        }),
    )
}

pub fn agent(id: &str, prompt: &str) -> PipelineNode {
    PipelineNode::new(
        id,
        id,
        NodeConfig::Agent(AgentStep {
            prompt: prompt.into(),
            model: None,
            skills: vec![],
            credentials: vec![],
            session_target: SessionTarget::Isolated,
            timeout: None,
        }),
    )
}

pub fn app(id: &str, app_id: &str) -> PipelineNode {
    PipelineNode::new(
        id,
        id,
        NodeConfig::App(AppStep {
            app_id: app_id.into(),
            prompt: String::new(),
            session_target: SessionTarget::Isolated,
            lifecycle: "ephemeral".into(),
            timeout: None,
        }),
    )
}

pub fn loop_node(id: &str, max_iterations: u32, condition: Option<&str>) -> PipelineNode {
    PipelineNode::new(
        id,
        id,
        NodeConfig::Loop(LoopStep {
            max_iterations,
            condition: condition.map(String::from),
        }),
    )
}

/// Unconditioned edge `source -> target` with id `source-target`.
pub fn edge(source: &str, target: &str) -> PipelineEdge {
    PipelineEdge::new(format!("{source}-{target}"), source, target)
}

/// Edge attached to a named output handle of `source`.
pub fn handle_edge(source: &str, handle: &str, target: &str) -> PipelineEdge {
    PipelineEdge::new(format!("{source}:{handle}-{target}"), source, target).from_handle(handle)
}

/// An active, enabled pipeline.
pub fn pipeline(id: &str, nodes: Vec<PipelineNode>, edges: Vec<PipelineEdge>) -> Pipeline {
    let mut p = Pipeline::new(id, id).with_nodes(nodes).with_edges(edges);
    p.status = pipewright_core::pipeline::PipelineStatus::Active;
    p.enabled = true;
    p
}
