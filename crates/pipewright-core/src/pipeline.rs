use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::node::{NodeConfig, PipelineNode};
use crate::run::RunReport;

/// Handle a loop node uses for edges into its body.
pub const LOOP_BODY_HANDLE: &str = "body";

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEdge {
    pub id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    /// Guard expression, evaluated against the source node's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl PipelineEdge {
    /// Create an unconditioned edge.
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
            condition: None,
        }
    }

    /// Attach the edge to a named output handle of the source.
    pub fn from_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    /// Guard the edge with an expression.
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Lifecycle status of a pipeline. Independent of the `enabled` flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Error,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<PipelineNode>,
    #[serde(default)]
    pub edges: Vec<PipelineEdge>,
    #[serde(default)]
    pub status: PipelineStatus,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    /// A new pipeline starts as a disabled draft.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            nodes: vec![],
            edges: vec![],
            status: PipelineStatus::Draft,
            enabled: false,
            run_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<PipelineNode>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_edges(mut self, edges: Vec<PipelineEdge>) -> Self {
        self.edges = edges;
        self
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Arm the pipeline: active and enabled.
    pub fn arm(&mut self) -> Result<()> {
        self.ensure_not_archived("arm")?;
        self.status = PipelineStatus::Active;
        self.enabled = true;
        self.last_error = None;
        self.touch();
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        if self.status != PipelineStatus::Active {
            return Err(PipelineError::Lifecycle(format!(
                "cannot pause a pipeline in status {:?}",
                self.status
            )));
        }
        self.status = PipelineStatus::Paused;
        self.touch();
        Ok(())
    }

    pub fn enable(&mut self) -> Result<()> {
        self.ensure_not_archived("enable")?;
        self.enabled = true;
        self.touch();
        Ok(())
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.touch();
    }

    /// Retire the pipeline. Archived pipelines cannot be re-armed.
    pub fn archive(&mut self) {
        self.status = PipelineStatus::Archived;
        self.enabled = false;
        self.touch();
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = PipelineStatus::Error;
        self.last_error = Some(message.into());
        self.touch();
    }

    /// Eligible for automatic triggering.
    pub fn is_schedulable(&self) -> bool {
        self.status == PipelineStatus::Active && self.enabled
    }

    /// Fold a finished run into the pipeline: bump the run count and copy
    /// the engine's node states.
    pub fn record_run(&mut self, report: &RunReport) {
        self.run_count += 1;
        for node in &mut self.nodes {
            if let Some(state) = report.node_states.get(&node.id) {
                node.state = state.clone();
            }
        }
        self.touch();
    }

    fn ensure_not_archived(&self, op: &str) -> Result<()> {
        if self.status == PipelineStatus::Archived {
            return Err(PipelineError::Lifecycle(format!(
                "cannot {op} an archived pipeline"
            )));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    // ── Graph queries ───────────────────────────────────────────────

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a PipelineEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a PipelineEdge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    pub fn trigger_nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.iter().filter(|n| n.is_trigger())
    }

    /// Nodes reachable from a loop's `body` edges without passing back
    /// through the loop node itself.
    pub fn loop_body(&self, loop_id: &str) -> HashSet<String> {
        let mut body = HashSet::new();
        let mut queue: VecDeque<&str> = self
            .outgoing(loop_id)
            .filter(|e| e.source_handle.as_deref() == Some(LOOP_BODY_HANDLE))
            .map(|e| e.target.as_str())
            .collect();

        while let Some(id) = queue.pop_front() {
            if id == loop_id || !body.insert(id.to_string()) {
                continue;
            }
            queue.extend(self.outgoing(id).map(|e| e.target.as_str()));
        }
        body
    }

    /// Whether `edge` leads from a loop's body back into the loop node.
    pub fn is_back_edge(&self, edge: &PipelineEdge) -> bool {
        match self.node(&edge.target) {
            Some(target) if matches!(target.config, NodeConfig::Loop(_)) => {
                edge.source == edge.target || self.loop_body(&edge.target).contains(&edge.source)
            }
            _ => false,
        }
    }

    /// Structural validation: unique node ids, edges between existing
    /// nodes on declared handles, and no cycles other than loop back-edges.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(PipelineError::InvalidGraph("node with empty id".into()));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(PipelineError::InvalidGraph(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        for edge in &self.edges {
            let source = self.node(&edge.source).ok_or_else(|| {
                PipelineError::InvalidGraph(format!(
                    "edge '{}' references missing source node '{}'",
                    edge.id, edge.source
                ))
            })?;
            if self.node(&edge.target).is_none() {
                return Err(PipelineError::InvalidGraph(format!(
                    "edge '{}' references missing target node '{}'",
                    edge.id, edge.target
                )));
            }
            if let Some(handle) = &edge.source_handle {
                let declared = source.descriptor().is_some_and(|d| d.has_output(handle));
                if !declared {
                    return Err(PipelineError::InvalidGraph(format!(
                        "edge '{}' uses unknown output handle '{}' of {} node '{}'",
                        edge.id,
                        handle,
                        source.node_type(),
                        source.id
                    )));
                }
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm over the forward edges.
    fn check_acyclic(&self) -> Result<()> {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let forward: Vec<&PipelineEdge> =
            self.edges.iter().filter(|e| !self.is_back_edge(e)).collect();

        for edge in &forward {
            *in_degree.entry(edge.target.as_str()).or_default() += 1;
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;

        while let Some(id) = queue.pop_front() {
            visited += 1;
            for edge in forward.iter().filter(|e| e.source == id) {
                if let Some(d) = in_degree.get_mut(edge.target.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(edge.target.as_str());
                    }
                }
            }
        }

        if visited != self.nodes.len() {
            return Err(PipelineError::InvalidGraph(
                "pipeline contains a cycle outside of a loop body".into(),
            ));
        }
        Ok(())
    }
}
