//! Stage caching for trainable components.
//!
//! [`TrainablePipe`] wraps a [`TrainableOps`] implementation with one
//! memoization table per stage. The wrapper is applied explicitly at
//! construction, so the caching behavior is part of the component's public
//! contract. Within one active cache scope, calling the same stage on the
//! same key any number of times performs the underlying computation exactly
//! once; this is what lets two components that share a subcomponent each
//! pay for its computation only once per pass. Outside a scope, or with
//! caching disabled, every call recomputes.
//!
//! Preprocess results are keyed by a per-scope integer handle assigned to
//! each document on first sight; collate and forward results are keyed by
//! structural content hashes. Inputs with no computable key silently bypass
//! the cache: caching is a pure optimization and must never change results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::batch::compress::{compress, decompress};
use crate::batch::{ContentHashable, Feature, FeatureBatch};
use crate::component::trainable::{TensorMap, TrainableOps};
use crate::core::document::{Document, DocumentId};
use crate::core::error::Result;
use crate::core::tensor::{Device, Parameter};

/// One of the memoized stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStage {
    /// Per-document feature extraction.
    Preprocess,
    /// Per-document feature extraction with gold supervision.
    PreprocessSupervised,
    /// Batch assembly.
    Collate,
    /// The forward pass.
    Forward,
}

#[derive(Default)]
struct CacheTables {
    // Scope-local integer handles standing in for document identity.
    handles: HashMap<DocumentId, u64>,
    next_handle: u64,
    preprocess: HashMap<u64, Feature>,
    preprocess_supervised: HashMap<u64, Feature>,
    collate: HashMap<String, TensorMap>,
    forward: HashMap<String, TensorMap>,
}

impl CacheTables {
    fn handle_for(&mut self, id: &DocumentId) -> u64 {
        if let Some(handle) = self.handles.get(id) {
            return *handle;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(id.clone(), handle);
        handle
    }

    fn clear(&mut self, stage: Option<CacheStage>) {
        match stage {
            None => {
                self.handles.clear();
                self.next_handle = 0;
                self.preprocess.clear();
                self.preprocess_supervised.clear();
                self.collate.clear();
                self.forward.clear();
            },
            Some(CacheStage::Preprocess) => self.preprocess.clear(),
            Some(CacheStage::PreprocessSupervised) => self.preprocess_supervised.clear(),
            Some(CacheStage::Collate) => self.collate.clear(),
            Some(CacheStage::Forward) => self.forward.clear(),
        }
    }
}

/// A trainable component wrapped with stage caching, a training flag and
/// instance-local metadata.
///
/// The cache tables are ordinary shared mutable state owned by this
/// instance; at most one in-flight pass per instance is assumed. Callers
/// needing parallelism must duplicate instances or serialize access.
pub struct TrainablePipe {
    name: String,
    ops: Box<dyn TrainableOps>,
    tables: Mutex<CacheTables>,
    cache_enabled: AtomicBool,
    training: AtomicBool,
    meta: Mutex<IndexMap<String, serde_json::Value>>,
}

impl TrainablePipe {
    /// Wrap a trainable component under the given name.
    pub fn new(name: impl Into<String>, ops: Box<dyn TrainableOps>) -> Self {
        Self {
            name: name.into(),
            ops,
            tables: Mutex::new(CacheTables::default()),
            cache_enabled: AtomicBool::new(false),
            training: AtomicBool::new(false),
            meta: Mutex::new(IndexMap::new()),
        }
    }

    /// The component name, used for batch columns and persistence paths.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped operations.
    pub fn ops(&self) -> &dyn TrainableOps {
        self.ops.as_ref()
    }

    /// Turn caching on or off for this pipe and, recursively, every
    /// trainable subcomponent it owns. Returns the prior flag of this pipe
    /// so callers can restore it.
    pub fn enable_cache(&self, enabled: bool) -> bool {
        let previous = self.cache_enabled.swap(enabled, Ordering::Relaxed);
        for sub in self.ops.subcomponents() {
            sub.enable_cache(enabled);
        }
        previous
    }

    /// Whether caching is currently enabled.
    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled.load(Ordering::Relaxed)
    }

    /// Clear one cache table, or all of them, recursively over all
    /// trainable subcomponents.
    pub fn reset_cache(&self, stage: Option<CacheStage>) {
        self.tables.lock().clear(stage);
        for sub in self.ops.subcomponents() {
            sub.reset_cache(stage);
        }
    }

    /// Set the training flag on this pipe and its subcomponents, returning
    /// the prior flag of this pipe.
    pub fn set_training(&self, training: bool) -> bool {
        let previous = self.training.swap(training, Ordering::Relaxed);
        for sub in self.ops.subcomponents() {
            sub.set_training(training);
        }
        previous
    }

    /// Whether this pipe is in training mode.
    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Read a metadata entry.
    pub fn meta(&self, key: &str) -> Option<serde_json::Value> {
        self.meta.lock().get(key).cloned()
    }

    /// Attach a metadata entry to this instance.
    pub fn set_meta(&self, key: impl Into<String>, value: serde_json::Value) {
        self.meta.lock().insert(key.into(), value);
    }

    /// Memoized feature extraction.
    pub fn preprocess(&self, doc: &Document) -> Result<Feature> {
        if !self.cache_enabled() {
            return self.ops.preprocess(doc);
        }
        let handle = self.tables.lock().handle_for(&doc.id);
        if let Some(hit) = self.tables.lock().preprocess.get(&handle) {
            return Ok(hit.clone());
        }
        let result = self.ops.preprocess(doc)?;
        self.tables.lock().preprocess.insert(handle, result.clone());
        Ok(result)
    }

    /// Memoized feature extraction with gold supervision.
    pub fn preprocess_supervised(&self, doc: &Document) -> Result<Feature> {
        if !self.cache_enabled() {
            return self.ops.preprocess_supervised(doc);
        }
        let handle = self.tables.lock().handle_for(&doc.id);
        if let Some(hit) = self.tables.lock().preprocess_supervised.get(&handle) {
            return Ok(hit.clone());
        }
        let result = self.ops.preprocess_supervised(doc)?;
        self.tables
            .lock()
            .preprocess_supervised
            .insert(handle, result.clone());
        Ok(result)
    }

    /// Memoized batch assembly. On a miss the stored result is tagged with
    /// its key so the forward cache can recognize the batch later.
    pub fn collate(&self, column: &[Feature]) -> Result<TensorMap> {
        if !self.cache_enabled() {
            return self.ops.collate(column);
        }
        let Some(key) = column.content_hash() else {
            // Unhashable input: degrade to no caching for this call.
            return self.ops.collate(column);
        };
        if let Some(hit) = self.tables.lock().collate.get(&key) {
            return Ok(hit.clone());
        }
        let mut result = self.ops.collate(column)?;
        result.cache_key = Some(key.clone());
        self.tables.lock().collate.insert(key, result.clone());
        Ok(result)
    }

    /// Memoized forward pass.
    pub fn forward(&self, inputs: &TensorMap) -> Result<TensorMap> {
        if !self.cache_enabled() {
            return self.ops.forward(inputs);
        }
        let Some(key) = inputs.cache_key.clone().or_else(|| inputs.content_hash()) else {
            return self.ops.forward(inputs);
        };
        if let Some(hit) = self.tables.lock().forward.get(&key) {
            return Ok(hit.clone());
        }
        let result = self.ops.forward(inputs)?;
        self.tables.lock().forward.insert(key, result.clone());
        Ok(result)
    }

    /// Preprocess a batch of documents into this pipe's column, routed
    /// through batch compression so that repeated payloads collapse into
    /// one even when the source cannot guarantee referential identity.
    pub fn make_batch(&self, docs: &[Document], supervision: bool) -> Result<Vec<Feature>> {
        let mut column = Vec::with_capacity(docs.len());
        for doc in docs {
            let payload = if supervision {
                self.preprocess_supervised(doc)?
            } else {
                self.preprocess(doc)?
            };
            column.push(payload);
        }
        let mut batch = FeatureBatch::new();
        batch.insert(self.name.clone(), column);
        let mut round_tripped = decompress(&compress(&batch));
        Ok(round_tripped.shift_remove(&self.name).unwrap_or_default())
    }

    /// Execute the whole batched lifecycle on a batch of documents:
    /// preprocess each, collate, forward, postprocess.
    pub fn batch_process(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        let column = self.make_batch(&docs, false)?;
        let inputs = self.collate(&column)?;
        let outputs = self.forward(&inputs)?;
        self.ops.postprocess(docs, &outputs)
    }

    /// All learnable parameters reachable from this pipe, with dotted
    /// paths. Subcomponent parameters are prefixed with the subcomponent
    /// name; a shared child therefore appears under each of its parents.
    pub fn named_parameters(&self) -> Vec<(String, Parameter)> {
        let mut params = self.ops.named_parameters();
        for sub in self.ops.subcomponents() {
            for (path, param) in sub.named_parameters() {
                params.push((format!("{}.{}", sub.name(), path), param));
            }
        }
        params
    }

    /// Load tensors into this pipe's parameters by exact dotted path,
    /// mutating allocations in place so that sharing is preserved. Returns
    /// the record keys that matched no parameter; loading is non-strict and
    /// the caller decides whether to warn.
    pub fn load_named_parameters(
        &self,
        entries: &IndexMap<String, crate::core::tensor::Tensor>,
    ) -> Result<Vec<String>> {
        let params: HashMap<String, Parameter> = self.named_parameters().into_iter().collect();
        let mut unexpected = Vec::new();
        for (path, tensor) in entries {
            match params.get(path) {
                Some(param) => param.load(tensor.clone())?,
                None => unexpected.push(path.clone()),
            }
        }
        Ok(unexpected)
    }

    /// Move every parameter of this pipe and its subcomponents to the
    /// given device. Idempotent.
    pub fn to_device(&self, device: Device) -> Result<()> {
        self.ops.to_device(device)?;
        for sub in self.ops.subcomponents() {
            sub.to_device(device)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TrainablePipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainablePipe")
            .field("name", &self.name)
            .field("cache_enabled", &self.cache_enabled())
            .field("training", &self.is_training())
            .finish()
    }
}

/// A scope during which memoization is active for a set of trainable
/// pipes.
///
/// Entering the scope enables caching on every pipe (recursively through
/// subcomponents) and remembers the prior flags; dropping it restores the
/// flags and clears the cache tables, on every exit path. Scopes are
/// strictly nested to one single-document or one-batch pass and must not
/// be shared across concurrent calls.
pub struct CacheScope {
    entries: Vec<(Arc<TrainablePipe>, bool)>,
}

impl CacheScope {
    /// Enable caching on the given pipes, capturing their prior flags.
    pub fn enter(pipes: &[Arc<TrainablePipe>]) -> Self {
        let entries = pipes
            .iter()
            .map(|pipe| (Arc::clone(pipe), pipe.enable_cache(true)))
            .collect();
        Self { entries }
    }
}

impl Drop for CacheScope {
    fn drop(&mut self) {
        for (pipe, previous) in self.entries.drain(..).rev() {
            pipe.enable_cache(previous);
            pipe.reset_cache(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::OpaqueFeature;
    use crate::core::tensor::Tensor;
    use std::sync::atomic::AtomicUsize;

    /// Shared handles onto a counting component's per-stage call counters.
    #[derive(Clone, Default)]
    struct Counters {
        preprocess: Arc<AtomicUsize>,
        collate: Arc<AtomicUsize>,
        forward: Arc<AtomicUsize>,
    }

    /// A counting component that tracks how often each stage runs.
    struct CountingOps {
        counters: Counters,
        subs: Vec<Arc<TrainablePipe>>,
    }

    impl CountingOps {
        fn new() -> Self {
            Self {
                counters: Counters::default(),
                subs: Vec::new(),
            }
        }

        fn with_sub(sub: Arc<TrainablePipe>) -> Self {
            let mut ops = Self::new();
            ops.subs.push(sub);
            ops
        }
    }

    impl TrainableOps for CountingOps {
        fn preprocess(&self, doc: &Document) -> Result<Feature> {
            self.counters.preprocess.fetch_add(1, Ordering::Relaxed);
            let mut payload = Feature::map();
            payload.insert("len", Feature::Int(doc.text.len() as i64));
            Ok(payload)
        }

        fn collate(&self, column: &[Feature]) -> Result<TensorMap> {
            self.counters.collate.fetch_add(1, Ordering::Relaxed);
            let lens: Vec<f32> = column
                .iter()
                .map(|p| match p.get("len") {
                    Some(Feature::Int(v)) => *v as f32,
                    _ => 0.0,
                })
                .collect();
            let mut out = TensorMap::new();
            out.insert("lens", Tensor::from_vec(vec![lens.len()], lens)?);
            Ok(out)
        }

        fn forward(&self, inputs: &TensorMap) -> Result<TensorMap> {
            self.counters.forward.fetch_add(1, Ordering::Relaxed);
            Ok(inputs.clone())
        }

        fn subcomponents(&self) -> Vec<Arc<TrainablePipe>> {
            self.subs.clone()
        }
    }

    fn counting_pipe(name: &str) -> (Arc<TrainablePipe>, Counters) {
        let ops = Box::new(CountingOps::new());
        let counters = ops.counters.clone();
        (Arc::new(TrainablePipe::new(name, ops)), counters)
    }

    fn calls(counters: &Counters) -> (usize, usize, usize) {
        (
            counters.preprocess.load(Ordering::Relaxed),
            counters.collate.load(Ordering::Relaxed),
            counters.forward.load(Ordering::Relaxed),
        )
    }

    #[test]
    fn test_preprocess_cache_hit() {
        let (pipe, ops) = counting_pipe("emb");
        let doc = Document::new("d1", "hello");

        pipe.enable_cache(true);
        let first = pipe.preprocess(&doc).unwrap();
        let second = pipe.preprocess(&doc).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls(&ops).0, 1);
    }

    #[test]
    fn test_cache_disabled_recomputes() {
        let (pipe, ops) = counting_pipe("emb");
        let doc = Document::new("d1", "hello");

        pipe.preprocess(&doc).unwrap();
        pipe.preprocess(&doc).unwrap();
        assert_eq!(calls(&ops).0, 2);
    }

    #[test]
    fn test_distinct_documents_miss() {
        let (pipe, ops) = counting_pipe("emb");
        pipe.enable_cache(true);
        pipe.preprocess(&Document::new("d1", "a")).unwrap();
        pipe.preprocess(&Document::new("d2", "b")).unwrap();
        assert_eq!(calls(&ops).0, 2);
    }

    #[test]
    fn test_scope_restores_flag_and_clears_tables() {
        let (pipe, ops) = counting_pipe("emb");
        let doc = Document::new("d1", "hello");

        {
            let _scope = CacheScope::enter(&[pipe.clone()]);
            pipe.preprocess(&doc).unwrap();
            pipe.preprocess(&doc).unwrap();
            assert_eq!(calls(&ops).0, 1);
        }
        assert!(!pipe.cache_enabled());

        // Outside the scope every call recomputes.
        pipe.preprocess(&doc).unwrap();
        pipe.preprocess(&doc).unwrap();
        assert_eq!(calls(&ops).0, 3);
    }

    #[test]
    fn test_collate_tags_result_and_forward_reuses_key() {
        let (pipe, ops) = counting_pipe("emb");
        pipe.enable_cache(true);

        let column = vec![Feature::Int(1), Feature::Int(2)];
        let collated = pipe.collate(&column).unwrap();
        assert!(collated.cache_key.is_some());

        // Same batch collated again: no recomputation.
        let again = pipe.collate(&column).unwrap();
        assert_eq!(calls(&ops).1, 1);
        assert_eq!(again.cache_key, collated.cache_key);

        // Forward keyed off the collate tag.
        pipe.forward(&collated).unwrap();
        pipe.forward(&again).unwrap();
        assert_eq!(calls(&ops).2, 1);
    }

    #[test]
    fn test_unkeyable_column_bypasses_cache() {
        let (pipe, ops) = counting_pipe("emb");
        pipe.enable_cache(true);

        let column = vec![Feature::Opaque(OpaqueFeature::new(()))];
        pipe.collate(&column).unwrap();
        pipe.collate(&column).unwrap();
        assert_eq!(calls(&ops).1, 2);
    }

    #[test]
    fn test_enable_cache_recurses_to_subcomponents() {
        let (sub, _) = counting_pipe("emb");
        let parent = Arc::new(TrainablePipe::new(
            "ner",
            Box::new(CountingOps::with_sub(sub.clone())),
        ));

        let previous = parent.enable_cache(true);
        assert!(!previous);
        assert!(sub.cache_enabled());

        parent.enable_cache(false);
        assert!(!sub.cache_enabled());
    }

    #[test]
    fn test_shared_subcomponent_computes_once() {
        let (emb, emb_ops) = counting_pipe("emb");
        let a = Arc::new(TrainablePipe::new(
            "a",
            Box::new(CountingOps::with_sub(emb.clone())),
        ));
        let b = Arc::new(TrainablePipe::new(
            "b",
            Box::new(CountingOps::with_sub(emb.clone())),
        ));

        let doc = Document::new("d1", "hello");
        let _scope = CacheScope::enter(&[a, b]);
        // Both parents consult the shared embedding for the same document.
        emb.preprocess(&doc).unwrap();
        emb.preprocess(&doc).unwrap();
        assert_eq!(calls(&emb_ops).0, 1);
    }

    #[test]
    fn test_reset_cache_single_stage() {
        let (pipe, ops) = counting_pipe("emb");
        pipe.enable_cache(true);
        let doc = Document::new("d1", "hello");
        let column = vec![Feature::Int(1)];

        pipe.preprocess(&doc).unwrap();
        pipe.collate(&column).unwrap();

        pipe.reset_cache(Some(CacheStage::Collate));
        pipe.preprocess(&doc).unwrap();
        pipe.collate(&column).unwrap();

        // Preprocess still cached, collate recomputed.
        assert_eq!(calls(&ops).0, 1);
        assert_eq!(calls(&ops).1, 2);
    }

    #[test]
    fn test_instance_metadata_round_trip() {
        let (pipe, _) = counting_pipe("emb");
        assert!(pipe.meta("trained_on").is_none());

        pipe.set_meta("trained_on", serde_json::json!("corpus-v1"));
        assert_eq!(pipe.meta("trained_on"), Some(serde_json::json!("corpus-v1")));

        // Setting again replaces the entry in place.
        pipe.set_meta("trained_on", serde_json::json!("corpus-v2"));
        assert_eq!(pipe.meta("trained_on"), Some(serde_json::json!("corpus-v2")));
    }

    #[test]
    fn test_make_batch_deduplicates_payloads() {
        let (pipe, _) = counting_pipe("emb");
        let docs = vec![Document::new("d1", "same"), Document::new("d2", "same")];
        let column = pipe.make_batch(&docs, false).unwrap();
        assert_eq!(column.len(), 2);
        assert_eq!(column[0], column[1]);
    }
}
