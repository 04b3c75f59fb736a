use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use pipewright_core::pipeline::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Pending,
    Taken,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Waiting,
    Ready,
    Unreachable,
}

/// Readiness bookkeeping for one walk over a set of nodes.
///
/// Only edges with both endpoints inside the scope (and that are not loop
/// back-edges) take part. A node becomes ready once every participating
/// incoming edge is resolved and at least one of them was taken; if all of
/// them died the node is unreachable and its own outgoing edges die with it.
/// Ready nodes are served depth-first in edge declaration order.
pub(super) struct Frontier<'g> {
    pipeline: &'g Pipeline,
    scope: &'g HashSet<String>,
    edges: Vec<usize>,
    edge_state: HashMap<usize, EdgeState>,
    inbox: HashMap<String, Vec<(String, Value)>>,
    seeds: HashMap<String, Option<Value>>,
    done: HashSet<String>,
    ready: Vec<String>,
    unreachable: Vec<String>,
}

impl<'g> Frontier<'g> {
    pub(super) fn new(
        pipeline: &'g Pipeline,
        scope: &'g HashSet<String>,
        back_edges: &HashSet<usize>,
        seeds: Vec<(String, Option<Value>)>,
    ) -> Self {
        let edges: Vec<usize> = pipeline
            .edges
            .iter()
            .enumerate()
            .filter(|(i, e)| {
                !back_edges.contains(i) && scope.contains(&e.source) && scope.contains(&e.target)
            })
            .map(|(i, _)| i)
            .collect();
        let edge_state = edges.iter().map(|i| (*i, EdgeState::Pending)).collect();

        let mut frontier = Self {
            pipeline,
            scope,
            edges,
            edge_state,
            inbox: HashMap::new(),
            seeds: HashMap::new(),
            done: HashSet::new(),
            ready: Vec::new(),
            unreachable: Vec::new(),
        };

        for (id, _) in seeds.iter().rev() {
            frontier.ready.push(id.clone());
        }
        frontier.seeds = seeds.into_iter().collect();

        // Nodes nothing can ever reach.
        let orphans: Vec<String> = pipeline
            .nodes
            .iter()
            .filter(|n| scope.contains(&n.id) && !frontier.seeds.contains_key(&n.id))
            .filter(|n| frontier.incoming(&n.id).is_empty())
            .map(|n| n.id.clone())
            .collect();
        for id in orphans {
            frontier.mark_unreachable(id);
        }
        frontier
    }

    /// Pop the next ready node with its merged input.
    pub(super) fn next_ready(&mut self) -> Option<(String, Option<Value>)> {
        while let Some(id) = self.ready.pop() {
            if !self.done.insert(id.clone()) {
                continue;
            }
            let input = match self.seeds.remove(&id) {
                Some(seed) => seed,
                None => self.merge_inputs(&id),
            };
            return Some((id, input));
        }
        None
    }

    /// Participating outgoing edges of a node, in declaration order.
    pub(super) fn outgoing(&self, node_id: &str) -> Vec<usize> {
        self.edges
            .iter()
            .copied()
            .filter(|i| self.pipeline.edges[*i].source == node_id)
            .collect()
    }

    /// Resolve the outgoing edges of a finished node. `Some(value)` marks an
    /// edge taken and carries the value to its target; `None` kills it.
    pub(super) fn complete(&mut self, decisions: Vec<(usize, Option<Value>)>) {
        let mut targets: Vec<String> = Vec::new();
        for (index, carried) in decisions {
            let edge = &self.pipeline.edges[index];
            match carried {
                Some(value) => {
                    self.edge_state.insert(index, EdgeState::Taken);
                    self.inbox
                        .entry(edge.target.clone())
                        .or_default()
                        .push((edge.source.clone(), value));
                }
                None => {
                    self.edge_state.insert(index, EdgeState::Dead);
                }
            }
            if !targets.contains(&edge.target) {
                targets.push(edge.target.clone());
            }
        }

        let mut newly_ready = Vec::new();
        for target in targets {
            match self.readiness(&target) {
                Readiness::Ready => newly_ready.push(target),
                Readiness::Unreachable => self.mark_unreachable(target),
                Readiness::Waiting => {}
            }
        }
        self.ready.extend(newly_ready.into_iter().rev());
    }

    /// Nodes found unreachable since the last call.
    pub(super) fn take_unreachable(&mut self) -> Vec<String> {
        std::mem::take(&mut self.unreachable)
    }

    fn incoming(&self, node_id: &str) -> Vec<usize> {
        self.edges
            .iter()
            .copied()
            .filter(|i| self.pipeline.edges[*i].target == node_id)
            .collect()
    }

    fn readiness(&self, node_id: &str) -> Readiness {
        if self.done.contains(node_id)
            || self.seeds.contains_key(node_id)
            || !self.scope.contains(node_id)
        {
            return Readiness::Waiting;
        }
        let mut any_taken = false;
        for index in self.incoming(node_id) {
            match self.edge_state.get(&index) {
                Some(EdgeState::Taken) => any_taken = true,
                Some(EdgeState::Dead) => {}
                _ => return Readiness::Waiting,
            }
        }
        if any_taken {
            Readiness::Ready
        } else {
            Readiness::Unreachable
        }
    }

    fn mark_unreachable(&mut self, node_id: String) {
        let mut work = vec![node_id];
        while let Some(id) = work.pop() {
            if self.seeds.contains_key(&id) || !self.done.insert(id.clone()) {
                continue;
            }
            self.unreachable.push(id.clone());
            for index in self.outgoing(&id) {
                self.edge_state.insert(index, EdgeState::Dead);
                let target = self.pipeline.edges[index].target.clone();
                match self.readiness(&target) {
                    Readiness::Ready => self.ready.push(target),
                    Readiness::Unreachable => work.push(target),
                    Readiness::Waiting => {}
                }
            }
        }
    }

    /// One taken edge hands over its value; several are keyed by source id.
    fn merge_inputs(&mut self, node_id: &str) -> Option<Value> {
        let mut arrivals = self.inbox.remove(node_id)?;
        let mut seen = HashSet::new();
        arrivals.retain(|(source, _)| seen.insert(source.clone()));

        if arrivals.len() == 1 {
            return arrivals.pop().map(|(_, value)| value);
        }
        let merged: Map<String, Value> = arrivals.into_iter().collect();
        Some(Value::Object(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::node::{NodeConfig, OutputAction, PipelineNode};
    use pipewright_core::pipeline::PipelineEdge;
    use serde_json::json;

    fn out(id: &str) -> PipelineNode {
        PipelineNode::new(
            id,
            id,
            NodeConfig::Output(OutputAction {
                format: Default::default(),
                destination: None,
                path: None,
            }),
        )
    }

    fn diamond() -> Pipeline {
        Pipeline::new("p", "diamond")
            .with_nodes(vec![out("a"), out("b"), out("c"), out("d")])
            .with_edges(vec![
                PipelineEdge::new("e1", "a", "b"),
                PipelineEdge::new("e2", "a", "c"),
                PipelineEdge::new("e3", "b", "d"),
                PipelineEdge::new("e4", "c", "d"),
            ])
    }

    fn all_ids(p: &Pipeline) -> HashSet<String> {
        p.nodes.iter().map(|n| n.id.clone()).collect()
    }

    #[test]
    fn test_depth_first_order_and_merge() {
        let p = diamond();
        let scope = all_ids(&p);
        let mut f = Frontier::new(&p, &scope, &HashSet::new(), vec![("a".into(), None)]);

        let (id, input) = f.next_ready().unwrap();
        assert_eq!(id, "a");
        assert!(input.is_none());
        f.complete(vec![(0, Some(json!(1))), (1, Some(json!(2)))]);

        assert_eq!(f.next_ready().unwrap().0, "b");
        f.complete(vec![(2, Some(json!("from b")))]);
        // d still waits on c
        assert_eq!(f.next_ready().unwrap().0, "c");
        f.complete(vec![(3, Some(json!("from c")))]);

        let (id, input) = f.next_ready().unwrap();
        assert_eq!(id, "d");
        assert_eq!(input, Some(json!({"b": "from b", "c": "from c"})));
        assert!(f.next_ready().is_none());
    }

    #[test]
    fn test_single_taken_edge_passes_value() {
        let p = diamond();
        let scope = all_ids(&p);
        let mut f = Frontier::new(&p, &scope, &HashSet::new(), vec![("a".into(), None)]);
        f.next_ready();
        f.complete(vec![(0, Some(json!(1))), (1, None)]);

        assert!(f.take_unreachable().contains(&"c".to_string()));
        let (id, input) = f.next_ready().unwrap();
        assert_eq!(id, "b");
        assert_eq!(input, Some(json!(1)));
        f.complete(vec![(2, Some(json!("only b")))]);
        assert_eq!(f.next_ready().unwrap(), ("d".to_string(), Some(json!("only b"))));
    }

    #[test]
    fn test_dead_edges_cascade() {
        let p = diamond();
        let scope = all_ids(&p);
        let mut f = Frontier::new(&p, &scope, &HashSet::new(), vec![("a".into(), None)]);
        f.next_ready();
        f.complete(vec![(0, None), (1, None)]);

        let mut gone = f.take_unreachable();
        gone.sort();
        assert_eq!(gone, vec!["b", "c", "d"]);
        assert!(f.next_ready().is_none());
    }

    #[test]
    fn test_orphans_are_unreachable() {
        let p = diamond();
        let scope = all_ids(&p);
        let mut f = Frontier::new(&p, &scope, &HashSet::new(), vec![("b".into(), None)]);
        let gone = f.take_unreachable();
        assert!(gone.contains(&"a".to_string()));
        assert!(gone.contains(&"c".to_string()));
        assert!(!gone.contains(&"d".to_string()));
        assert_eq!(f.next_ready().unwrap().0, "b");
    }
}
