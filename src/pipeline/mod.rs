//! The pipeline executor.
//!
//! A [`Pipeline`] is an ordered list of named components applied to
//! documents. Rule-based components run document by document; trainable
//! components run batch by batch through their caching wrapper. Application
//! always happens inside a cache scope covering every enabled trainable
//! component, with training mode forced off for the duration and restored
//! afterwards, on every exit path.

pub mod scoring;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::batch::compress::{compress, CompressedBatch};
use crate::batch::FeatureBatch;
use crate::component::cached::{CacheScope, TrainablePipe};
use crate::component::trainable::TensorMap;
use crate::component::Component;
use crate::config::PipelineConfig;
use crate::config_error;
use crate::core::document::Document;
use crate::core::error::{PipelineError, Result};
use crate::core::registry::ComponentRegistry;
use crate::core::tensor::{Device, Parameter};
use crate::persistence::DiskHook;

/// Factory producing a fresh document from raw text.
pub type DocFactory = Box<dyn Fn(&str) -> Document + Send + Sync>;

/// An ordered, named list of annotation components and the machinery to
/// run them over documents.
pub struct Pipeline {
    lang: String,
    components: Vec<(String, Component)>,
    disabled: Vec<String>,
    batch_size: usize,
    meta: IndexMap<String, serde_json::Value>,
    component_configs: IndexMap<String, serde_json::Value>,
    doc_factory: Option<DocFactory>,
    tokenizer: Option<Box<dyn DiskHook>>,
    vocab: Option<Box<dyn DiskHook>>,
    next_doc: AtomicU64,
}

impl Pipeline {
    /// An empty pipeline for the given language.
    pub fn new(lang: impl Into<String>) -> Self {
        Self {
            lang: lang.into(),
            components: Vec::new(),
            disabled: Vec::new(),
            batch_size: 4,
            meta: IndexMap::new(),
            component_configs: IndexMap::new(),
            doc_factory: None,
            tokenizer: None,
            vocab: None,
            next_doc: AtomicU64::new(0),
        }
    }

    /// Build a pipeline from a validated config, creating each component
    /// through the registry using the `@factory` key of its block.
    pub fn from_config(config: &PipelineConfig, registry: &ComponentRegistry) -> Result<Self> {
        config.validate()?;
        let mut pipeline = Self::new(config.lang.clone());
        pipeline.batch_size = config.batch_size;
        for name in &config.pipeline {
            let factory = config.factory_of(name)?;
            let block = &config.components[name];
            let component = registry.create(factory, block)?;
            pipeline.add_pipe(name.clone(), component)?;
            pipeline
                .component_configs
                .insert(name.clone(), block.clone());
        }
        pipeline.disabled = config.disabled.clone();
        Ok(pipeline)
    }

    /// The structural config of this pipeline, rebuildable through
    /// [`Pipeline::from_config`] given the same registry.
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            lang: self.lang.clone(),
            pipeline: self.pipe_names(),
            components: self.component_configs.clone(),
            batch_size: self.batch_size,
            disabled: self.disabled.clone(),
        }
    }

    /// The language tag.
    pub fn lang(&self) -> &str {
        &self.lang
    }

    /// The batch size used by streaming application and scoring.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Change the batch size. Zero is a configuration error.
    pub fn set_batch_size(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(config_error!("batch_size must be positive"));
        }
        self.batch_size = batch_size;
        Ok(())
    }

    /// Pipeline-level metadata.
    pub fn meta(&self) -> &IndexMap<String, serde_json::Value> {
        &self.meta
    }

    /// Set a metadata entry.
    pub fn set_meta(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.meta.insert(key.into(), value);
    }

    pub(crate) fn set_meta_map(&mut self, meta: IndexMap<String, serde_json::Value>) {
        self.meta = meta;
    }

    /// Install a factory for [`Pipeline::make_doc`].
    pub fn set_doc_factory(&mut self, factory: DocFactory) {
        self.doc_factory = Some(factory);
    }

    /// Attach a tokenizer persisted alongside the pipeline.
    pub fn set_tokenizer(&mut self, tokenizer: Box<dyn DiskHook>) {
        self.tokenizer = Some(tokenizer);
    }

    /// Attach a vocabulary persisted alongside the pipeline.
    pub fn set_vocab(&mut self, vocab: Box<dyn DiskHook>) {
        self.vocab = Some(vocab);
    }

    pub(crate) fn tokenizer(&self) -> Option<&dyn DiskHook> {
        self.tokenizer.as_deref()
    }

    pub(crate) fn vocab(&self) -> Option<&dyn DiskHook> {
        self.vocab.as_deref()
    }

    /// Build a fresh document from raw text, using the installed factory
    /// or a counter-based identifier.
    pub fn make_doc(&self, text: &str) -> Document {
        match &self.doc_factory {
            Some(factory) => factory(text),
            None => {
                let n = self.next_doc.fetch_add(1, Ordering::Relaxed);
                Document::new(format!("doc-{n}"), text)
            },
        }
    }

    /// Append a component under a unique name.
    pub fn add_pipe(&mut self, name: impl Into<String>, component: Component) -> Result<()> {
        let name = name.into();
        if self.has_pipe(&name) {
            return Err(PipelineError::AlreadyExists {
                resource: "Component".to_string(),
                id: name,
            });
        }
        self.components.push((name, component));
        Ok(())
    }

    /// Look up a component by name.
    pub fn get_pipe(&self, name: &str) -> Result<&Component> {
        self.components
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
            .ok_or_else(|| PipelineError::NotFound {
                resource: "Component".to_string(),
                id: name.to_string(),
            })
    }

    /// Whether a component with this name exists.
    pub fn has_pipe(&self, name: &str) -> bool {
        self.components.iter().any(|(n, _)| n == name)
    }

    /// Component names in application order, including disabled ones.
    pub fn pipe_names(&self) -> Vec<String> {
        self.components.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Names currently disabled.
    pub fn disabled(&self) -> &[String] {
        &self.disabled
    }

    fn enabled_components(&self) -> impl Iterator<Item = &(String, Component)> {
        self.components
            .iter()
            .filter(|(name, _)| !self.disabled.contains(name))
    }

    /// The caching wrappers of every enabled trainable component.
    pub fn trainable_pipes(&self) -> Vec<Arc<TrainablePipe>> {
        self.enabled_components()
            .filter_map(|(_, c)| c.as_trainable().cloned())
            .collect()
    }

    /// Temporarily restrict application to the named components. The
    /// previous disabled set is restored when the returned guard drops.
    pub fn select_pipes<'p>(&'p mut self, enable: &[&str]) -> Result<SelectPipesGuard<'p>> {
        for name in enable {
            if !self.has_pipe(name) {
                return Err(PipelineError::NotFound {
                    resource: "Component".to_string(),
                    id: name.to_string(),
                });
            }
        }
        let previous = std::mem::take(&mut self.disabled);
        self.disabled = self
            .components
            .iter()
            .map(|(n, _)| n.clone())
            .filter(|n| !enable.contains(&n.as_str()))
            .collect();
        Ok(SelectPipesGuard {
            pipeline: self,
            previous,
        })
    }

    /// Apply the pipeline to one document: eval mode, a cache scope for
    /// the duration, components in order.
    pub fn apply(&self, doc: Document) -> Result<Document> {
        let pipes = self.trainable_pipes();
        let _restore = TrainRestore::eval(&pipes);
        let _scope = CacheScope::enter(&pipes);
        let mut docs = self.run_components(vec![doc])?;
        docs.pop().ok_or_else(|| PipelineError::Component {
            name: "pipeline".to_string(),
            message: "component returned an empty batch".to_string(),
        })
    }

    /// Build a document from text and apply the pipeline to it.
    pub fn apply_text(&self, text: &str) -> Result<Document> {
        self.apply(self.make_doc(text))
    }

    /// Apply the pipeline lazily to a stream of documents.
    ///
    /// Documents are pulled from the source in chunks of `batch_size`
    /// (defaulting to the pipeline's) and yielded strictly in input order.
    /// An explicit batch size of zero is treated as one document per chunk;
    /// unlike [`Pipeline::set_batch_size`] this path cannot report an error,
    /// so it degrades instead of rejecting.
    /// Training mode is forced off on every trainable component while the
    /// stream is alive and restored when it is dropped, consumed or not;
    /// each chunk runs under its own cache scope. After the first error the
    /// stream yields that error once and then terminates.
    pub fn apply_stream<I>(&self, docs: I, batch_size: Option<usize>) -> PipeStream<'_, I::IntoIter>
    where
        I: IntoIterator<Item = Document>,
    {
        let pipes = self.trainable_pipes();
        PipeStream {
            pipeline: self,
            source: docs.into_iter(),
            batch_size: batch_size.unwrap_or(self.batch_size).max(1),
            buffer: VecDeque::new(),
            errored: false,
            _restore: TrainRestore::eval(&pipes),
        }
    }

    /// Run every enabled component over one batch, without touching modes
    /// or scopes. Callers arrange those.
    pub(crate) fn run_components(&self, mut docs: Vec<Document>) -> Result<Vec<Document>> {
        for (name, component) in self.enabled_components() {
            docs = Self::run_component(name, component, docs)?;
        }
        Ok(docs)
    }

    pub(crate) fn run_component(
        name: &str,
        component: &Component,
        docs: Vec<Document>,
    ) -> Result<Vec<Document>> {
        debug!(component = name, batch = docs.len(), "applying component");
        match component {
            Component::Rule(rule) => docs
                .into_iter()
                .map(|doc| {
                    rule.apply(doc).map_err(|err| PipelineError::Component {
                        name: name.to_string(),
                        message: err.to_string(),
                    })
                })
                .collect(),
            Component::Trainable(pipe) => {
                pipe.batch_process(docs)
                    .map_err(|err| PipelineError::Component {
                        name: name.to_string(),
                        message: err.to_string(),
                    })
            },
        }
    }

    /// Preprocess one document through every enabled trainable component:
    /// one single-payload column per component.
    pub fn preprocess(&self, doc: &Document, supervision: bool) -> Result<FeatureBatch> {
        let mut batch = FeatureBatch::new();
        for (name, component) in self.enabled_components() {
            if let Some(pipe) = component.as_trainable() {
                let payload = if supervision {
                    pipe.preprocess_supervised(doc)?
                } else {
                    pipe.preprocess(doc)?
                };
                batch.insert(name.clone(), vec![payload]);
            }
        }
        Ok(batch)
    }

    /// Preprocess a batch of documents into per-component columns.
    pub fn preprocess_many(&self, docs: &[Document], supervision: bool) -> Result<FeatureBatch> {
        let mut batch = FeatureBatch::new();
        for (name, component) in self.enabled_components() {
            if let Some(pipe) = component.as_trainable() {
                batch.insert(name.clone(), pipe.make_batch(docs, supervision)?);
            }
        }
        Ok(batch)
    }

    /// Preprocess a batch and compress it for transport or storage.
    pub fn preprocess_many_compressed(
        &self,
        docs: &[Document],
        supervision: bool,
    ) -> Result<CompressedBatch> {
        Ok(compress(&self.preprocess_many(docs, supervision)?))
    }

    /// Collate each component's column of a feature batch.
    pub fn collate(&self, batch: &FeatureBatch) -> Result<IndexMap<String, TensorMap>> {
        let mut out = IndexMap::with_capacity(batch.len());
        for (name, column) in batch {
            let pipe = self
                .get_pipe(name)?
                .as_trainable()
                .ok_or_else(|| config_error!("component '{}' is not trainable", name))?
                .clone();
            out.insert(name.clone(), pipe.collate(column)?);
        }
        Ok(out)
    }

    /// Complete initialization of every enabled component from gold
    /// documents, in pipeline order. Components without a `post_init` hook
    /// are skipped.
    pub fn post_init(&self, docs: &[Document]) -> Result<()> {
        for (_, component) in self.enabled_components() {
            component.post_init(docs)?;
        }
        Ok(())
    }

    /// Every named parameter reachable from the pipeline, with paths
    /// prefixed by component name. Shared parameters appear once per path.
    pub fn named_parameters(&self) -> Vec<(String, Parameter)> {
        let mut params = Vec::new();
        for (name, component) in &self.components {
            if let Some(pipe) = component.as_trainable() {
                for (path, param) in pipe.named_parameters() {
                    params.push((format!("{name}.{path}"), param));
                }
            }
        }
        params
    }

    /// Distinct parameter allocations, deduplicated by identity.
    pub fn parameters(&self) -> Vec<Parameter> {
        let mut seen = std::collections::HashSet::new();
        self.named_parameters()
            .into_iter()
            .filter(|(_, p)| seen.insert(p.allocation_id()))
            .map(|(_, p)| p)
            .collect()
    }

    /// Move every trainable component's tensors to a device.
    pub fn to_device(&self, device: Device) -> Result<()> {
        for pipe in self.trainable_pipes() {
            pipe.to_device(device)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("lang", &self.lang)
            .field("pipeline", &self.pipe_names())
            .field("disabled", &self.disabled)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

/// Guard forcing a set of pipes into eval mode, restoring their previous
/// training flags on drop.
pub(crate) struct TrainRestore {
    entries: Vec<(Arc<TrainablePipe>, bool)>,
}

impl TrainRestore {
    pub(crate) fn eval(pipes: &[Arc<TrainablePipe>]) -> Self {
        let entries = pipes
            .iter()
            .map(|pipe| (Arc::clone(pipe), pipe.set_training(false)))
            .collect();
        Self { entries }
    }
}

impl Drop for TrainRestore {
    fn drop(&mut self) {
        for (pipe, previous) in self.entries.drain(..).rev() {
            pipe.set_training(previous);
        }
    }
}

/// Guard returned by [`Pipeline::select_pipes`]; restores the previous
/// disabled set on drop.
pub struct SelectPipesGuard<'p> {
    pipeline: &'p mut Pipeline,
    previous: Vec<String>,
}

impl Drop for SelectPipesGuard<'_> {
    fn drop(&mut self) {
        self.pipeline.disabled = std::mem::take(&mut self.previous);
    }
}

impl std::ops::Deref for SelectPipesGuard<'_> {
    type Target = Pipeline;

    fn deref(&self) -> &Pipeline {
        self.pipeline
    }
}

impl std::ops::DerefMut for SelectPipesGuard<'_> {
    fn deref_mut(&mut self) -> &mut Pipeline {
        self.pipeline
    }
}

/// Lazy, order-preserving iterator over pipeline output.
pub struct PipeStream<'p, I: Iterator<Item = Document>> {
    pipeline: &'p Pipeline,
    source: I,
    batch_size: usize,
    buffer: VecDeque<Document>,
    errored: bool,
    _restore: TrainRestore,
}

impl<I: Iterator<Item = Document>> Iterator for PipeStream<'_, I> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.errored {
            return None;
        }
        if let Some(doc) = self.buffer.pop_front() {
            return Some(Ok(doc));
        }
        let chunk: Vec<Document> = self.source.by_ref().take(self.batch_size).collect();
        if chunk.is_empty() {
            return None;
        }
        let pipes = self.pipeline.trainable_pipes();
        let result = {
            let _scope = CacheScope::enter(&pipes);
            self.pipeline.run_components(chunk)
        };
        match result {
            Ok(docs) => {
                self.buffer.extend(docs);
                self.buffer.pop_front().map(Ok)
            },
            Err(err) => {
                self.errored = true;
                Some(Err(err))
            },
        }
    }
}
