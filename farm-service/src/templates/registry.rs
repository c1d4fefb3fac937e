// Template Registry
// Lookup of job templates by id, loaded from YAML files

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};
use crate::jobs::TemplateId;

use super::models::{parse_template, TemplateDocument};

/// Lookup of job templates
#[async_trait]
pub trait TemplateRegistry: Send + Sync {
    /// Resolve a template by id
    async fn get(&self, id: &TemplateId) -> ServiceResult<Arc<TemplateDocument>>;

    /// Register a template, replacing any previous version
    async fn add(&self, template: TemplateDocument) -> ServiceResult<()>;

    /// All registered templates
    async fn list(&self) -> ServiceResult<Vec<Arc<TemplateDocument>>>;
}

/// In-memory template registry
#[derive(Default)]
pub struct InMemoryTemplateRegistry {
    templates: Arc<RwLock<HashMap<TemplateId, Arc<TemplateDocument>>>>,
}

impl InMemoryTemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.yaml`/`.yml` file in a directory as a template
    pub async fn load_dir(&self, dir: impl AsRef<Path>) -> ServiceResult<usize> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir)
            .map_err(|err| ServiceError::internal(format!("failed to read {:?}: {}", dir, err)))?;

        let mut loaded = 0;
        for entry in entries {
            let entry = entry
                .map_err(|err| ServiceError::internal(format!("failed to read {:?}: {}", dir, err)))?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            let content = fs::read_to_string(&path).map_err(|err| {
                ServiceError::internal(format!("failed to read {:?}: {}", path, err))
            })?;
            let template = parse_template(&content)?;
            debug!(template_id = %template.id, path = %path.display(), "loaded template");
            self.add(template).await?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[async_trait]
impl TemplateRegistry for InMemoryTemplateRegistry {
    async fn get(&self, id: &TemplateId) -> ServiceResult<Arc<TemplateDocument>> {
        let templates = self.templates.read().await;
        templates
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("template {}", id)))
    }

    async fn add(&self, template: TemplateDocument) -> ServiceResult<()> {
        let mut templates = self.templates.write().await;
        templates.insert(TemplateId::new(template.id.clone()), Arc::new(template));
        Ok(())
    }

    async fn list(&self) -> ServiceResult<Vec<Arc<TemplateDocument>>> {
        let templates = self.templates.read().await;
        Ok(templates.values().cloned().collect())
    }
}
