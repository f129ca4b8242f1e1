//! Pipeline definitions served from the engine configuration

use super::PipelineConfigStore;
use crate::config::{ConfigError, EngineConfig, PipelineConfig};
use async_trait::async_trait;
use std::collections::HashMap;

/// Serves the `[[pipelines]]` tables of a loaded configuration
#[derive(Debug, Clone, Default)]
pub struct StaticConfigStore {
    pipelines: HashMap<String, PipelineConfig>,
}

impl StaticConfigStore {
    pub fn new(pipelines: impl IntoIterator<Item = PipelineConfig>) -> Self {
        Self {
            pipelines: pipelines
                .into_iter()
                .map(|pipeline| (pipeline.project.clone(), pipeline))
                .collect(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.pipelines.iter().cloned())
    }

    pub fn projects(&self) -> Vec<&str> {
        let mut projects: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        projects.sort_unstable();
        projects
    }
}

#[async_trait]
impl PipelineConfigStore for StaticConfigStore {
    async fn get_config(&self, project: &str) -> Result<PipelineConfig, ConfigError> {
        self.pipelines
            .get(project)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProject(project.to_string()))
    }
}
