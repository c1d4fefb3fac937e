// Graph Registry
// Content-hash-addressed storage for immutable build graphs

use crate::error::{ServiceError, ServiceResult};
use crate::graph::builder::{
    extend_graph, AggregateDefinition, GroupDefinition, LabelDefinition,
};
use crate::graph::model::{Graph, GraphHash};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage for immutable, content-addressed graphs.
///
/// Adding the same graph twice returns the same hash; a stored graph is
/// never modified or removed while any job still references it.
#[async_trait::async_trait]
pub trait GraphRegistry: Send + Sync {
    /// Register a graph, returning its content hash. Registering a graph
    /// that already exists is a no-op.
    async fn add(&self, graph: Graph) -> ServiceResult<GraphHash>;

    /// Resolve a graph by hash
    async fn get(&self, hash: &GraphHash) -> ServiceResult<Arc<Graph>>;

    /// Register a new graph extending `base` with the given definitions,
    /// returning the new graph's hash. The base graph is left untouched.
    async fn append(
        &self,
        base: &GraphHash,
        groups: Vec<GroupDefinition>,
        aggregates: Vec<AggregateDefinition>,
        labels: Vec<LabelDefinition>,
    ) -> ServiceResult<GraphHash>;
}

/// In-memory graph registry
#[derive(Default)]
pub struct InMemoryGraphRegistry {
    graphs: Arc<RwLock<HashMap<GraphHash, Arc<Graph>>>>,
}

impl InMemoryGraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct graphs stored
    pub async fn len(&self) -> usize {
        self.graphs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.graphs.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl GraphRegistry for InMemoryGraphRegistry {
    async fn add(&self, graph: Graph) -> ServiceResult<GraphHash> {
        let hash = graph.content_hash()?;

        let mut graphs = self.graphs.write().await;
        if let Some(existing) = graphs.get(&hash) {
            // Same hash must mean same content
            if **existing != graph {
                return Err(ServiceError::internal(format!(
                    "graph hash collision on {}",
                    hash
                )));
            }
            return Ok(hash);
        }

        graphs.insert(hash.clone(), Arc::new(graph));
        Ok(hash)
    }

    async fn get(&self, hash: &GraphHash) -> ServiceResult<Arc<Graph>> {
        let graphs = self.graphs.read().await;
        graphs
            .get(hash)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("graph {}", hash)))
    }

    async fn append(
        &self,
        base: &GraphHash,
        groups: Vec<GroupDefinition>,
        aggregates: Vec<AggregateDefinition>,
        labels: Vec<LabelDefinition>,
    ) -> ServiceResult<GraphHash> {
        let base_graph = self.get(base).await?;
        let extended = extend_graph(&base_graph, groups, aggregates, labels)?;
        self.add(extended).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::{build_graph, NodeDefinition};

    fn make_graph(names: &[&str]) -> Graph {
        build_graph(
            vec![GroupDefinition::new(
                "linux",
                names.iter().map(|name| NodeDefinition::new(*name)).collect(),
            )],
            Vec::new(),
            Vec::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_is_deduplicated() {
        let registry = InMemoryGraphRegistry::new();

        let first = registry.add(make_graph(&["Compile"])).await.unwrap();
        let second = registry.add(make_graph(&["Compile"])).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_unknown_hash() {
        let registry = InMemoryGraphRegistry::new();
        let result = registry.get(&GraphHash::new("deadbeef")).await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_append_preserves_base() {
        let registry = InMemoryGraphRegistry::new();
        let base = registry.add(make_graph(&["Setup"])).await.unwrap();

        let extended = registry
            .append(
                &base,
                vec![GroupDefinition::new(
                    "linux",
                    vec![NodeDefinition::new("Compile")],
                )],
                Vec::new(),
                Vec::new(),
            )
            .await
            .unwrap();

        assert_ne!(base, extended);

        // The old hash still resolves to the original content
        let original = registry.get(&base).await.unwrap();
        assert_eq!(original.groups.len(), 1);
        assert_eq!(original.content_hash().unwrap(), base);

        let new_graph = registry.get(&extended).await.unwrap();
        assert_eq!(new_graph.groups.len(), 2);
    }
}
