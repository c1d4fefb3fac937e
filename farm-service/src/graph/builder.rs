// Graph Builder
// Resolves name-based group/label definitions into an immutable graph,
// and structurally extends existing graphs with appended groups

use crate::error::{InvalidReason, ServiceError};
use crate::graph::model::{Aggregate, Graph, Label, Node, NodeGroup, NodeRef, Priority};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Error type for graph construction
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Two nodes or aggregates share a name
    DuplicateName,
    /// Reference to a node that is not declared earlier in the graph
    UnknownDependency,
    /// Structurally invalid definition
    InvalidStructure,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn duplicate_name(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::DuplicateName,
        }
    }

    pub fn unknown_dependency(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
        }
    }

    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::InvalidStructure,
        }
    }
}

impl From<GraphError> for ServiceError {
    fn from(err: GraphError) -> Self {
        ServiceError::invalid(InvalidReason::InvalidGraph, err.to_string())
    }
}

/// Definition of a node before name resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    /// Node name, unique within the graph
    pub name: String,

    /// Names of nodes whose outputs this node consumes
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Names of nodes that must finish before this node runs, without
    /// feeding it outputs
    #[serde(default)]
    pub after: Vec<String>,

    /// Relative scheduling priority
    #[serde(default)]
    pub priority: Priority,

    /// Whether this node may be retried
    #[serde(default = "default_true")]
    pub allow_retry: bool,

    /// Whether this node may start before its order-only dependencies finish
    #[serde(default)]
    pub run_early: bool,

    /// Arbitrary key/value annotations
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl NodeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            after: Vec::new(),
            priority: Priority::Normal,
            allow_retry: true,
            run_early: false,
            properties: HashMap::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_after(mut self, after: Vec<String>) -> Self {
        self.after = after;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_allow_retry(mut self, allow_retry: bool) -> Self {
        self.allow_retry = allow_retry;
        self
    }
}

/// Definition of a group of nodes executed together
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDefinition {
    /// The type of agent required to execute this group
    pub agent_type: String,

    /// Node definitions in execution order
    pub nodes: Vec<NodeDefinition>,
}

impl GroupDefinition {
    pub fn new(agent_type: impl Into<String>, nodes: Vec<NodeDefinition>) -> Self {
        Self {
            agent_type: agent_type.into(),
            nodes,
        }
    }
}

/// Definition of a named node set usable as a target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateDefinition {
    pub name: String,

    /// Names of the nodes included in the aggregate
    pub nodes: Vec<String>,
}

/// Definition of a published status rollup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDefinition {
    pub name: String,

    #[serde(default)]
    pub category: String,

    /// Names of nodes that must succeed for the label to succeed
    pub required_nodes: Vec<String>,

    /// Names of additional nodes whose outcome contributes to the label
    #[serde(default)]
    pub included_nodes: Vec<String>,
}

/// Build a new graph from definitions.
///
/// Node references resolve only to nodes declared earlier in the definition
/// sequence (an earlier group, or the same group at a lower index), which
/// rules out cycles and forward references by construction.
pub fn build_graph(
    groups: Vec<GroupDefinition>,
    aggregates: Vec<AggregateDefinition>,
    labels: Vec<LabelDefinition>,
) -> Result<Graph, GraphError> {
    extend_graph(&Graph::empty(), groups, aggregates, labels)
}

/// Produce a new graph extending `base` with appended groups, aggregates,
/// and labels. The base graph is not modified; its groups and labels form
/// an identical prefix of the result.
pub fn extend_graph(
    base: &Graph,
    groups: Vec<GroupDefinition>,
    aggregates: Vec<AggregateDefinition>,
    labels: Vec<LabelDefinition>,
) -> Result<Graph, GraphError> {
    let mut graph = base.clone();

    // Seed the name table with the existing nodes
    let mut nodes_by_name: HashMap<String, NodeRef> = HashMap::new();
    for (group_idx, group) in graph.groups.iter().enumerate() {
        for (node_idx, node) in group.nodes.iter().enumerate() {
            nodes_by_name.insert(node.name.to_lowercase(), NodeRef::new(group_idx, node_idx));
        }
    }

    for group_def in groups {
        let group_idx = graph.groups.len();
        let mut nodes = Vec::with_capacity(group_def.nodes.len());

        for (node_idx, node_def) in group_def.nodes.into_iter().enumerate() {
            let key = node_def.name.to_lowercase();
            if nodes_by_name.contains_key(&key) {
                return Err(GraphError::duplicate_name(format!(
                    "node '{}' is declared more than once",
                    node_def.name
                )));
            }

            let input_dependencies =
                resolve_names(&node_def.name, &node_def.inputs, &nodes_by_name)?;
            let after = resolve_names(&node_def.name, &node_def.after, &nodes_by_name)?;

            // Order dependencies are the inputs plus any explicit after-deps
            let mut order_dependencies = input_dependencies.clone();
            for dep in after {
                if !order_dependencies.contains(&dep) {
                    order_dependencies.push(dep);
                }
            }

            nodes.push(Node {
                name: node_def.name.clone(),
                input_dependencies,
                order_dependencies,
                priority: node_def.priority,
                allow_retry: node_def.allow_retry,
                run_early: node_def.run_early,
                properties: node_def.properties,
            });

            nodes_by_name.insert(key, NodeRef::new(group_idx, node_idx));
        }

        if nodes.is_empty() {
            return Err(GraphError::invalid_structure(format!(
                "group {} contains no nodes",
                group_idx
            )));
        }

        graph.groups.push(NodeGroup {
            agent_type: group_def.agent_type,
            nodes,
        });
    }

    for aggregate_def in aggregates {
        if graph.aggregate_by_name(&aggregate_def.name).is_some() {
            return Err(GraphError::duplicate_name(format!(
                "aggregate '{}' is declared more than once",
                aggregate_def.name
            )));
        }

        let nodes = resolve_names(&aggregate_def.name, &aggregate_def.nodes, &nodes_by_name)?;
        graph.aggregates.push(Aggregate {
            name: aggregate_def.name,
            nodes,
        });
    }

    for label_def in labels {
        let required_nodes =
            resolve_names(&label_def.name, &label_def.required_nodes, &nodes_by_name)?;
        let explicit =
            resolve_names(&label_def.name, &label_def.included_nodes, &nodes_by_name)?;

        let mut seeds = required_nodes.clone();
        seeds.extend(explicit);
        let included_nodes = dependency_closure(&graph, &seeds);

        graph.labels.push(Label {
            name: label_def.name,
            category: label_def.category,
            required_nodes,
            included_nodes,
        });
    }

    Ok(graph)
}

fn resolve_names(
    owner: &str,
    names: &[String],
    nodes_by_name: &HashMap<String, NodeRef>,
) -> Result<Vec<NodeRef>, GraphError> {
    let mut refs = Vec::with_capacity(names.len());
    for name in names {
        match nodes_by_name.get(&name.to_lowercase()) {
            Some(node_ref) => refs.push(*node_ref),
            None => {
                return Err(GraphError::unknown_dependency(format!(
                    "'{}' references unknown node '{}'",
                    owner, name
                )))
            }
        }
    }
    Ok(refs)
}

/// Expand a seed set of nodes to include their transitive input
/// dependencies, ordered by graph position
fn dependency_closure(graph: &Graph, seeds: &[NodeRef]) -> Vec<NodeRef> {
    let mut closed: HashSet<NodeRef> = HashSet::new();
    let mut stack: Vec<NodeRef> = seeds.to_vec();

    while let Some(node_ref) = stack.pop() {
        if !closed.insert(node_ref) {
            continue;
        }
        if let Some(node) = graph.node(node_ref) {
            stack.extend(node.input_dependencies.iter().copied());
        }
    }

    let mut ordered: Vec<NodeRef> = closed.into_iter().collect();
    ordered.sort_by_key(|node_ref| (node_ref.group_idx, node_ref.node_idx));
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_group(agent_type: &str, nodes: Vec<NodeDefinition>) -> GroupDefinition {
        GroupDefinition::new(agent_type, nodes)
    }

    #[test]
    fn test_build_resolves_dependencies() {
        let graph = build_graph(
            vec![make_group(
                "linux",
                vec![
                    NodeDefinition::new("Compile"),
                    NodeDefinition::new("Test").with_inputs(vec!["Compile".to_string()]),
                ],
            )],
            Vec::new(),
            Vec::new(),
        )
        .unwrap();

        let test = graph.node(NodeRef::new(0, 1)).unwrap();
        assert_eq!(test.input_dependencies, vec![NodeRef::new(0, 0)]);
        assert_eq!(test.order_dependencies, vec![NodeRef::new(0, 0)]);
    }

    #[test]
    fn test_after_deps_are_order_only() {
        let graph = build_graph(
            vec![make_group(
                "linux",
                vec![
                    NodeDefinition::new("Compile"),
                    NodeDefinition::new("Cleanup").with_after(vec!["Compile".to_string()]),
                ],
            )],
            Vec::new(),
            Vec::new(),
        )
        .unwrap();

        let cleanup = graph.node(NodeRef::new(0, 1)).unwrap();
        assert!(cleanup.input_dependencies.is_empty());
        assert_eq!(cleanup.order_dependencies, vec![NodeRef::new(0, 0)]);
    }

    #[test]
    fn test_forward_reference_is_rejected() {
        let result = build_graph(
            vec![make_group(
                "linux",
                vec![
                    NodeDefinition::new("Test").with_inputs(vec!["Compile".to_string()]),
                    NodeDefinition::new("Compile"),
                ],
            )],
            Vec::new(),
            Vec::new(),
        );

        let err = result.unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);
    }

    #[test]
    fn test_duplicate_node_name_is_rejected() {
        let result = build_graph(
            vec![make_group(
                "linux",
                vec![NodeDefinition::new("Compile"), NodeDefinition::new("compile")],
            )],
            Vec::new(),
            Vec::new(),
        );

        let err = result.unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::DuplicateName);
    }

    #[test]
    fn test_label_includes_dependency_closure() {
        let graph = build_graph(
            vec![make_group(
                "linux",
                vec![
                    NodeDefinition::new("Compile"),
                    NodeDefinition::new("Cook").with_inputs(vec!["Compile".to_string()]),
                    NodeDefinition::new("Package").with_inputs(vec!["Cook".to_string()]),
                ],
            )],
            Vec::new(),
            vec![LabelDefinition {
                name: "Packaged Build".to_string(),
                category: "Builds".to_string(),
                required_nodes: vec!["Package".to_string()],
                included_nodes: Vec::new(),
            }],
        )
        .unwrap();

        let label = &graph.labels[0];
        assert_eq!(label.required_nodes, vec![NodeRef::new(0, 2)]);
        assert_eq!(
            label.included_nodes,
            vec![NodeRef::new(0, 0), NodeRef::new(0, 1), NodeRef::new(0, 2)]
        );
    }

    #[test]
    fn test_extend_leaves_base_unchanged() {
        let base = build_graph(
            vec![make_group("linux", vec![NodeDefinition::new("Setup")])],
            Vec::new(),
            Vec::new(),
        )
        .unwrap();
        let base_hash = base.content_hash().unwrap();

        let extended = extend_graph(
            &base,
            vec![make_group(
                "linux",
                vec![NodeDefinition::new("Compile").with_inputs(vec!["Setup".to_string()])],
            )],
            Vec::new(),
            Vec::new(),
        )
        .unwrap();

        // The base graph is untouched and still hashes identically
        assert_eq!(base.groups.len(), 1);
        assert_eq!(base.content_hash().unwrap(), base_hash);

        // The extension shares the old groups as a prefix
        assert_eq!(extended.groups.len(), 2);
        assert_eq!(extended.groups[0], base.groups[0]);
        let compile = extended.node(NodeRef::new(1, 0)).unwrap();
        assert_eq!(compile.input_dependencies, vec![NodeRef::new(0, 0)]);
    }

    #[test]
    fn test_cross_group_dependency_resolves() {
        let graph = build_graph(
            vec![
                make_group("linux", vec![NodeDefinition::new("Compile")]),
                make_group(
                    "windows",
                    vec![NodeDefinition::new("Package").with_inputs(vec!["Compile".to_string()])],
                ),
            ],
            Vec::new(),
            Vec::new(),
        )
        .unwrap();

        let package = graph.node(NodeRef::new(1, 0)).unwrap();
        assert_eq!(package.input_dependencies, vec![NodeRef::new(0, 0)]);
    }

    #[test]
    fn test_empty_group_is_rejected() {
        let result = build_graph(
            vec![make_group("linux", Vec::new())],
            Vec::new(),
            Vec::new(),
        );

        assert_eq!(result.unwrap_err().kind, GraphErrorKind::InvalidStructure);
    }
}
