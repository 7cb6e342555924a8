//! Declarative pipeline configuration.
//!
//! A [`PipelineConfig`] captures everything needed to rebuild a pipeline's
//! structure: language, component order, per-component factory blocks, the
//! batch size and the disabled set. The component blocks are opaque JSON
//! passed through to the registered factories; the `@factory` key inside
//! each block names the factory to invoke.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config_error;
use crate::core::error::Result;

fn default_batch_size() -> usize {
    4
}

/// Serializable description of a pipeline's structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Language tag of the documents this pipeline processes.
    pub lang: String,

    /// Component names in application order.
    #[serde(default)]
    pub pipeline: Vec<String>,

    /// Per-component factory configuration, keyed by component name. Each
    /// block carries an `@factory` key naming the registered factory.
    #[serde(default)]
    pub components: IndexMap<String, serde_json::Value>,

    /// Batch size used by streaming application and scoring.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Components present but skipped during application.
    #[serde(default)]
    pub disabled: Vec<String>,
}

impl PipelineConfig {
    /// A minimal config with no components.
    pub fn new(lang: impl Into<String>) -> Self {
        Self {
            lang: lang.into(),
            pipeline: Vec::new(),
            components: IndexMap::new(),
            batch_size: default_batch_size(),
            disabled: Vec::new(),
        }
    }

    /// Check internal consistency: unique names, a block for every
    /// pipeline entry, disabled names that actually exist, a positive
    /// batch size.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(config_error!("batch_size must be positive"));
        }
        let mut seen = std::collections::HashSet::new();
        for name in &self.pipeline {
            if !seen.insert(name) {
                return Err(config_error!("duplicate component name '{}'", name));
            }
            if !self.components.contains_key(name) {
                return Err(config_error!(
                    "component '{}' listed in pipeline but has no configuration block",
                    name
                ));
            }
        }
        for name in &self.disabled {
            if !self.pipeline.contains(name) {
                return Err(config_error!(
                    "disabled component '{}' is not in the pipeline",
                    name
                ));
            }
        }
        Ok(())
    }

    /// The factory name declared in a component's block.
    pub fn factory_of(&self, name: &str) -> Result<&str> {
        let block = self
            .components
            .get(name)
            .ok_or_else(|| config_error!("no configuration block for component '{}'", name))?;
        block
            .get("@factory")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                config_error!(
                    "component '{}' has no '@factory' key in its configuration block",
                    name
                )
            })
    }

    /// Read and validate a config from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config to a JSON file, pretty-printed.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
