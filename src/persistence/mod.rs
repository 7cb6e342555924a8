//! On-disk pipeline layout.
//!
//! A saved pipeline is a directory:
//!
//! ```text
//! <dir>/
//!   config.json        structural config, rebuildable via a registry
//!   meta.json          pipeline metadata plus the save timestamp
//!   vocab/             optional vocabulary state
//!   tokenizer/         optional tokenizer state
//!   <component>/       per-component non-tensor state (only if hooked)
//!   tensors/           parameter records, shared allocations collapsed
//! ```
//!
//! Saving replaces the target directory wholesale, but refuses to wipe a
//! directory that does not look like a previously saved pipeline. Loading
//! is non-strict on tensors: records matching no parameter are logged and
//! skipped.

pub mod tensors;

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::info;

use crate::component::cached::TrainablePipe;
use crate::core::error::Result;
use crate::core::registry::ComponentRegistry;
use crate::persistence_error;
use crate::pipeline::Pipeline;
use crate::PipelineConfig;

/// Disk round-trip for a piece of non-tensor state (vocabularies,
/// tokenizers, rule tables).
///
/// Both directions take `&self`; implementations that mutate on load use
/// interior mutability, matching how components are shared.
pub trait DiskHook: Send + Sync {
    /// Write state into the given directory, which exists and is empty.
    fn to_disk(&self, dir: &Path) -> Result<()>;

    /// Read state back from the given directory.
    fn from_disk(&self, dir: &Path) -> Result<()>;
}

const CONFIG_FILE: &str = "config.json";
const META_FILE: &str = "meta.json";
const VOCAB_DIR: &str = "vocab";
const TOKENIZER_DIR: &str = "tokenizer";
const TENSORS_DIR: &str = "tensors";

impl Pipeline {
    fn named_trainables(&self) -> Vec<(String, Arc<TrainablePipe>)> {
        self.pipe_names()
            .into_iter()
            .filter_map(|name| {
                let pipe = self.get_pipe(&name).ok()?.as_trainable().cloned()?;
                Some((name, pipe))
            })
            .collect()
    }

    /// Save the pipeline to a directory, replacing previous contents.
    ///
    /// A non-empty target that does not carry a `config.json` is treated
    /// as foreign and never deleted.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            let looks_saved = path.join(CONFIG_FILE).exists();
            let is_empty = path.read_dir()?.next().is_none();
            if !looks_saved && !is_empty {
                return Err(persistence_error!(
                    "refusing to overwrite '{}': not a saved pipeline directory",
                    path.display()
                ));
            }
            std::fs::remove_dir_all(path)?;
        }
        std::fs::create_dir_all(path)?;

        self.config().to_file(path.join(CONFIG_FILE))?;

        let mut meta = self.meta().clone();
        meta.insert(
            "saved_at".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );
        std::fs::write(path.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;

        if let Some(vocab) = self.vocab() {
            let dir = path.join(VOCAB_DIR);
            std::fs::create_dir_all(&dir)?;
            vocab.to_disk(&dir)?;
        }
        if let Some(tokenizer) = self.tokenizer() {
            let dir = path.join(TOKENIZER_DIR);
            std::fs::create_dir_all(&dir)?;
            tokenizer.to_disk(&dir)?;
        }

        for name in self.pipe_names() {
            let component = self.get_pipe(&name)?;
            if let Some(hook) = component.disk_hook() {
                let dir = path.join(&name);
                std::fs::create_dir_all(&dir)?;
                hook.to_disk(&dir)?;
            }
        }

        let tensors_dir = path.join(TENSORS_DIR);
        std::fs::create_dir_all(&tensors_dir)?;
        tensors::save(&tensors_dir, &self.named_trainables())?;

        info!(path = %path.display(), "pipeline saved");
        Ok(())
    }

    /// Load previously saved state into this pipeline's components. The
    /// pipeline structure must already match the saved config.
    pub fn load_state(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.join(CONFIG_FILE).exists() {
            return Err(persistence_error!(
                "'{}' is not a saved pipeline directory",
                path.display()
            ));
        }

        let meta_path = path.join(META_FILE);
        if meta_path.exists() {
            let text = std::fs::read_to_string(meta_path)?;
            let meta: IndexMap<String, serde_json::Value> = serde_json::from_str(&text)?;
            self.set_meta_map(meta);
        }

        if let Some(vocab) = self.vocab() {
            let dir = path.join(VOCAB_DIR);
            if dir.exists() {
                vocab.from_disk(&dir)?;
            }
        }
        if let Some(tokenizer) = self.tokenizer() {
            let dir = path.join(TOKENIZER_DIR);
            if dir.exists() {
                tokenizer.from_disk(&dir)?;
            }
        }

        for name in self.pipe_names() {
            let component = self.get_pipe(&name)?;
            if let Some(hook) = component.disk_hook() {
                let dir = path.join(&name);
                if dir.exists() {
                    hook.from_disk(&dir)?;
                }
            }
        }

        let tensors_dir = path.join(TENSORS_DIR);
        if tensors_dir.exists() {
            tensors::load(&tensors_dir, &self.named_trainables())?;
        }

        info!(path = %path.display(), "pipeline state loaded");
        Ok(())
    }

    /// Rebuild a pipeline from a saved directory: the config through the
    /// registry, then the saved state.
    pub fn load_from(path: impl AsRef<Path>, registry: &ComponentRegistry) -> Result<Pipeline> {
        let path = path.as_ref();
        let config = PipelineConfig::from_file(path.join(CONFIG_FILE))?;
        let mut pipeline = Pipeline::from_config(&config, registry)?;
        pipeline.load_state(path)?;
        Ok(pipeline)
    }
}
