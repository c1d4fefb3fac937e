// Build Graph Model
// Immutable, content-addressed build graphs: ordered groups of nodes,
// named aggregates, and labels rolling up subsets of nodes

use crate::error::{ServiceError, ServiceResult};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Scheduling priority for jobs and nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    Lowest,
    BelowNormal,
    Normal,
    AboveNormal,
    Highest,
}

impl Priority {
    /// Numeric weight used when deriving batch schedule priorities
    pub fn weight(self) -> i32 {
        match self {
            Priority::Lowest => 1,
            Priority::BelowNormal => 2,
            Priority::Normal => 3,
            Priority::AboveNormal => 4,
            Priority::Highest => 5,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Lowest => write!(f, "Lowest"),
            Priority::BelowNormal => write!(f, "BelowNormal"),
            Priority::Normal => write!(f, "Normal"),
            Priority::AboveNormal => write!(f, "AboveNormal"),
            Priority::Highest => write!(f, "Highest"),
        }
    }
}

/// Reference to a node by position within a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    /// Index of the group containing the node
    pub group_idx: usize,
    /// Index of the node within its group
    pub node_idx: usize,
}

impl NodeRef {
    pub fn new(group_idx: usize, node_idx: usize) -> Self {
        Self {
            group_idx,
            node_idx,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_idx, self.node_idx)
    }
}

/// One unit of work within a graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Name of the node, unique within the graph
    pub name: String,

    /// Nodes whose outputs this node consumes; must finish successfully
    /// before this node can run
    #[serde(default)]
    pub input_dependencies: Vec<NodeRef>,

    /// Nodes that must finish (in any state) before this node can run.
    /// Always a superset of the input dependencies.
    #[serde(default)]
    pub order_dependencies: Vec<NodeRef>,

    /// Relative scheduling priority
    #[serde(default)]
    pub priority: Priority,

    /// Whether this node may be retried after a failed attempt
    #[serde(default = "default_true")]
    pub allow_retry: bool,

    /// Whether this node may start before its order-only dependencies finish
    #[serde(default)]
    pub run_early: bool,

    /// Arbitrary key/value annotations carried through to steps
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

/// An ordered set of nodes executed together as one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    /// The type of agent required to execute this group
    pub agent_type: String,

    /// Nodes in execution order
    pub nodes: Vec<Node>,
}

/// A named set of nodes usable as a build target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    /// Name of the aggregate, unique within the graph
    pub name: String,

    /// Nodes included in the aggregate
    pub nodes: Vec<NodeRef>,
}

/// A named rollup of outcome and timing over a dependency-closed node set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    /// Display name of the label
    pub name: String,

    /// Dashboard category the label is shown under
    #[serde(default)]
    pub category: String,

    /// Nodes that must succeed for the label to succeed
    pub required_nodes: Vec<NodeRef>,

    /// All nodes whose outcome contributes to the label; the dependency
    /// closure of the required and explicitly included nodes
    pub included_nodes: Vec<NodeRef>,
}

/// Content hash identifying a graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphHash(pub String);

impl GraphHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }
}

impl fmt::Display for GraphHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable build dependency graph.
///
/// Graphs are identified by the hash of their serialized content and are
/// never edited in place; structural extension produces a new graph that
/// shares the old groups and labels as a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Graph {
    /// Ordered node groups
    pub groups: Vec<NodeGroup>,

    /// Named node sets usable as targets
    #[serde(default)]
    pub aggregates: Vec<Aggregate>,

    /// Published status rollups
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl Graph {
    /// Create an empty graph
    pub fn empty() -> Self {
        Self {
            groups: Vec::new(),
            aggregates: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Get a node by reference
    pub fn node(&self, node_ref: NodeRef) -> Option<&Node> {
        self.groups
            .get(node_ref.group_idx)
            .and_then(|group| group.nodes.get(node_ref.node_idx))
    }

    /// Find a node by name, matched case-insensitively
    pub fn node_by_name(&self, name: &str) -> Option<NodeRef> {
        for (group_idx, group) in self.groups.iter().enumerate() {
            for (node_idx, node) in group.nodes.iter().enumerate() {
                if node.name.eq_ignore_ascii_case(name) {
                    return Some(NodeRef::new(group_idx, node_idx));
                }
            }
        }
        None
    }

    /// Find an aggregate by name, matched case-insensitively
    pub fn aggregate_by_name(&self, name: &str) -> Option<&Aggregate> {
        self.aggregates
            .iter()
            .find(|aggregate| aggregate.name.eq_ignore_ascii_case(name))
    }

    /// Total number of nodes across all groups
    pub fn node_count(&self) -> usize {
        self.groups.iter().map(|group| group.nodes.len()).sum()
    }

    /// Compute the content hash identifying this graph
    pub fn content_hash(&self) -> ServiceResult<GraphHash> {
        let body = serde_json::to_vec(self)
            .map_err(|err| ServiceError::internal(format!("failed to serialize graph: {}", err)))?;

        let mut hasher = Sha256::new();
        hasher.update(&body);
        Ok(GraphHash(format!("{:x}", hasher.finalize())))
    }
}
