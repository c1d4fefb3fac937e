// Graph Module
// Immutable build graph model, builder, and content-addressed registry

pub mod builder;
pub mod model;
pub mod registry;

pub use builder::{
    build_graph, extend_graph, AggregateDefinition, GraphError, GraphErrorKind, GroupDefinition,
    LabelDefinition, NodeDefinition,
};
pub use model::{Aggregate, Graph, GraphHash, Label, Node, NodeGroup, NodeRef, Priority};
pub use registry::{GraphRegistry, InMemoryGraphRegistry};
