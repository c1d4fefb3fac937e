// Template Models
// Declarative job templates parsed from YAML

use serde::{Deserialize, Serialize};

use crate::error::{InvalidReason, ServiceError, ServiceResult};
use crate::graph::{
    build_graph, AggregateDefinition, Graph, GroupDefinition, LabelDefinition, Priority,
};

/// A job template: the graph definition plus creation defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDocument {
    /// Identifier used when creating jobs
    pub id: String,

    /// Display name for new jobs
    pub name: String,

    /// Whether jobs may run against a shelved change
    #[serde(default = "default_true")]
    pub allow_preflights: bool,

    /// Default priority for new jobs
    #[serde(default)]
    pub priority: Priority,

    /// Default argument list for new jobs
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Groups of nodes making up the initial graph
    pub groups: Vec<GroupDefinition>,

    /// Named node sets usable as targets
    #[serde(default)]
    pub aggregates: Vec<AggregateDefinition>,

    /// Published status rollups
    #[serde(default)]
    pub labels: Vec<LabelDefinition>,
}

fn default_true() -> bool {
    true
}

impl TemplateDocument {
    /// Build the initial graph for a job created from this template
    pub fn build_graph(&self) -> ServiceResult<Graph> {
        let graph = build_graph(
            self.groups.clone(),
            self.aggregates.clone(),
            self.labels.clone(),
        )?;
        Ok(graph)
    }
}

/// Parse a template from YAML
pub fn parse_template(content: &str) -> ServiceResult<TemplateDocument> {
    serde_yaml::from_str(content).map_err(|err| {
        ServiceError::invalid(
            InvalidReason::InvalidTemplate,
            format!("failed to parse template: {}", err),
        )
    })
}
