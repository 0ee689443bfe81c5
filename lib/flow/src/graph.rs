//! Template graphs: the authored directed graph of node definitions.
//!
//! Built from a flat list of [`NodeDefinition`]s. Edges come from
//! `next_nodes`, `parallel_nodes`, and exclusive-gateway routing targets;
//! every referenced key must resolve. The graph is validated as a DAG with
//! exactly one start node before a template may be activated.

use crate::error::GraphError;
use crate::node::{NodeDefinition, NodeKind};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;

/// The reason an edge exists, for introspection and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Plain sequence edge from `next_nodes`.
    Sequence,
    /// Fan-out edge from `parallel_nodes`.
    Parallel,
    /// Conditional edge from an exclusive gateway.
    Conditional,
}

/// A directed graph of node definitions keyed by node key.
#[derive(Debug, Clone)]
pub struct TemplateGraph {
    graph: DiGraph<NodeDefinition, EdgeKind>,
    key_to_index: HashMap<String, NodeIndex>,
}

impl TemplateGraph {
    /// Builds a graph from node definitions.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate node keys or references to unknown
    /// keys. Structural validation beyond that is done by [`validate`].
    ///
    /// [`validate`]: TemplateGraph::validate
    pub fn build(definitions: Vec<NodeDefinition>) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut key_to_index = HashMap::new();

        for definition in definitions {
            let key = definition.node_key.clone();
            if key_to_index.contains_key(&key) {
                return Err(GraphError::DuplicateNodeKey { key });
            }
            let index = graph.add_node(definition);
            key_to_index.insert(key, index);
        }

        // Resolve edges after all nodes exist.
        let indices: Vec<NodeIndex> = graph.node_indices().collect();
        for index in indices {
            let (from_key, targets) = {
                let node = &graph[index];
                let mut targets: Vec<(String, EdgeKind)> = Vec::new();
                targets.extend(
                    node.next_nodes
                        .iter()
                        .map(|k| (k.clone(), EdgeKind::Sequence)),
                );
                targets.extend(
                    node.parallel_nodes
                        .iter()
                        .map(|k| (k.clone(), EdgeKind::Parallel)),
                );
                if let NodeKind::Exclusive(config) = &node.kind {
                    targets.extend(
                        config
                            .conditions
                            .iter()
                            .map(|c| (c.next_node.clone(), EdgeKind::Conditional)),
                    );
                    if let Some(default_path) = &config.default_path {
                        targets.push((default_path.clone(), EdgeKind::Conditional));
                    }
                }
                (node.node_key.clone(), targets)
            };

            for (to_key, edge_kind) in targets {
                let Some(&target) = key_to_index.get(&to_key) else {
                    return Err(GraphError::UnknownNodeKey {
                        from: from_key,
                        to: to_key,
                    });
                };
                // The same pair may be referenced both as a sequence and a
                // conditional target; keep one edge per reason.
                let duplicate = graph
                    .edges_connecting(index, target)
                    .any(|e| *e.weight() == edge_kind);
                if !duplicate {
                    graph.add_edge(index, target, edge_kind);
                }
            }
        }

        Ok(Self {
            graph,
            key_to_index,
        })
    }

    /// Returns the definition for a node key.
    #[must_use]
    pub fn get(&self, node_key: &str) -> Option<&NodeDefinition> {
        let index = self.key_to_index.get(node_key)?;
        self.graph.node_weight(*index)
    }

    /// Returns all node definitions.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.graph.node_weights()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the start nodes of the template.
    #[must_use]
    pub fn start_nodes(&self) -> Vec<&NodeDefinition> {
        self.graph
            .node_weights()
            .filter(|n| n.kind.is_start())
            .collect()
    }

    /// Returns the unique start node.
    ///
    /// # Errors
    ///
    /// Returns an error when the template has zero or multiple start nodes.
    pub fn start_node(&self) -> Result<&NodeDefinition, GraphError> {
        let starts = self.start_nodes();
        match starts.len() {
            0 => Err(GraphError::NoStartNode),
            1 => Ok(starts[0]),
            count => Err(GraphError::MultipleStartNodes { count }),
        }
    }

    /// Returns the downstream definitions of a node key.
    #[must_use]
    pub fn successors(&self, node_key: &str) -> Vec<&NodeDefinition> {
        let Some(&index) = self.key_to_index.get(node_key) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .filter_map(|edge| self.graph.node_weight(edge.target()))
            .collect()
    }

    /// Returns the upstream definitions of a node key.
    #[must_use]
    pub fn predecessors(&self, node_key: &str) -> Vec<&NodeDefinition> {
        let Some(&index) = self.key_to_index.get(node_key) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(index, Direction::Incoming)
            .filter_map(|edge| self.graph.node_weight(edge.source()))
            .collect()
    }

    /// Returns the number of inbound edges of a node key.
    #[must_use]
    pub fn inbound_count(&self, node_key: &str) -> usize {
        let Some(&index) = self.key_to_index.get(node_key) else {
            return 0;
        };
        self.graph
            .edges_directed(index, Direction::Incoming)
            .count()
    }

    /// Validates the template graph.
    ///
    /// Checks, in order:
    /// - exactly one start node exists,
    /// - the graph is acyclic,
    /// - every node's configuration is structurally valid.
    ///
    /// # Errors
    ///
    /// Returns the first failure found.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.start_node()?;

        if petgraph::algo::is_cyclic_directed(&self.graph) {
            return Err(GraphError::CycleDetected);
        }

        for node in self.nodes() {
            node.kind
                .validate()
                .map_err(|reason| GraphError::InvalidNodeConfig {
                    key: node.node_key.clone(),
                    reason,
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ExclusiveConfig, FailureMode, RouteCondition};

    fn start(key: &str, next: &[&str]) -> NodeDefinition {
        NodeDefinition::new(key, key, NodeKind::Start).with_next(next.iter().copied())
    }

    fn end(key: &str) -> NodeDefinition {
        NodeDefinition::new(key, key, NodeKind::End)
    }

    fn passthrough(key: &str, next: &[&str]) -> NodeDefinition {
        // A timer stands in for an arbitrary intermediate node.
        NodeDefinition::new(
            key,
            key,
            NodeKind::Timer(crate::node::TimerConfig::Delay {
                duration: "1s".to_string(),
            }),
        )
        .with_next(next.iter().copied())
    }

    #[test]
    fn build_and_traverse() {
        let graph = TemplateGraph::build(vec![
            start("s", &["a"]),
            passthrough("a", &["e"]),
            end("e"),
        ])
        .expect("build");

        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.successors("s").len(), 1);
        assert_eq!(graph.successors("s")[0].node_key, "a");
        assert_eq!(graph.predecessors("e")[0].node_key, "a");
        assert_eq!(graph.inbound_count("e"), 1);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn unknown_reference_rejected() {
        let result = TemplateGraph::build(vec![start("s", &["missing"])]);
        assert!(matches!(
            result,
            Err(GraphError::UnknownNodeKey { from, to }) if from == "s" && to == "missing"
        ));
    }

    #[test]
    fn duplicate_key_rejected() {
        let result = TemplateGraph::build(vec![start("s", &[]), start("s", &[])]);
        assert!(matches!(result, Err(GraphError::DuplicateNodeKey { .. })));
    }

    #[test]
    fn cycle_rejected() {
        let graph = TemplateGraph::build(vec![
            start("s", &["a"]),
            passthrough("a", &["b"]),
            passthrough("b", &["a"]),
        ])
        .expect("build");
        assert!(matches!(graph.validate(), Err(GraphError::CycleDetected)));
    }

    #[test]
    fn missing_start_rejected() {
        let graph = TemplateGraph::build(vec![passthrough("a", &["e"]), end("e")]).expect("build");
        assert!(matches!(graph.validate(), Err(GraphError::NoStartNode)));
    }

    #[test]
    fn multiple_starts_rejected() {
        let graph = TemplateGraph::build(vec![start("s1", &["e"]), start("s2", &["e"]), end("e")])
            .expect("build");
        assert!(matches!(
            graph.validate(),
            Err(GraphError::MultipleStartNodes { count: 2 })
        ));
    }

    #[test]
    fn exclusive_targets_become_edges() {
        let exclusive = NodeDefinition::new(
            "route",
            "route",
            NodeKind::Exclusive(ExclusiveConfig {
                conditions: vec![RouteCondition {
                    expression: "x > 0".to_string(),
                    next_node: "yes".to_string(),
                    priority: 1,
                }],
                default_path: Some("no".to_string()),
                failure_mode: FailureMode::Fail,
            }),
        );
        let graph = TemplateGraph::build(vec![
            start("s", &["route"]),
            exclusive,
            passthrough("yes", &["e"]),
            passthrough("no", &["e"]),
            end("e"),
        ])
        .expect("build");

        let successor_keys: Vec<&str> = graph
            .successors("route")
            .iter()
            .map(|n| n.node_key.as_str())
            .collect();
        assert!(successor_keys.contains(&"yes"));
        assert!(successor_keys.contains(&"no"));
        assert!(graph.validate().is_ok());
    }
}
