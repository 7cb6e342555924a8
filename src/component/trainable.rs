//! The trainable component contract.
//!
//! Concrete neural modules implement [`TrainableOps`]; the executor never
//! calls them directly but always through a [`TrainablePipe`]
//! (`component::cached`), which layers stage caching on top. A trainable
//! component may own nested trainable subcomponents, and several parents
//! may share one child by reference, forming a directed acyclic composition
//! graph.

use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::batch::Feature;
use crate::component::cached::TrainablePipe;
use crate::core::document::Document;
use crate::core::error::{PipelineError, Result};
use crate::core::tensor::{Device, Parameter, Tensor};
use crate::persistence::DiskHook;

/// Failure in one stage of the trainable lifecycle.
#[derive(Debug, Error)]
pub enum StageError {
    /// Feature extraction failed for a document.
    #[error("preprocess failed: {0}")]
    Preprocess(String),
    /// Batch assembly failed.
    #[error("collate failed: {0}")]
    Collate(String),
    /// The forward pass failed.
    #[error("forward failed: {0}")]
    Forward(String),
    /// Writing predictions back onto documents failed.
    #[error("postprocess failed: {0}")]
    Postprocess(String),
}

/// The collated, batched input/output of a forward pass: named tensors.
///
/// The collate cache tags its result with the key it was stored under, so
/// the forward cache can recognize a batch it has already seen without
/// re-hashing tensor contents.
#[derive(Debug, Clone, Default)]
pub struct TensorMap {
    /// Named tensors, in insertion order.
    pub tensors: IndexMap<String, Tensor>,
    /// Cache key assigned by the collate cache, if this map was produced
    /// under an active cache scope.
    pub cache_key: Option<String>,
}

impl TensorMap {
    /// An empty tensor map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a named tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Look up a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }
}

/// Scorer over (prediction, gold) document pairs.
pub trait Scorer: Send + Sync {
    /// Compute metrics for the given pairs. The first element of each pair
    /// is the predicted document, the second the untouched gold document.
    fn score(&self, pairs: &[(Document, Document)]) -> Result<serde_json::Value>;
}

/// Operations of a trainable component.
///
/// Only `preprocess`, `collate` and `forward` are mandatory; every other
/// hook defaults to a no-op so that absence simply skips the behavior.
pub trait TrainableOps: Send + Sync {
    /// Extract the features the network needs from one document.
    fn preprocess(&self, doc: &Document) -> Result<Feature>;

    /// Extract features including gold supervision. Defaults to the same
    /// features as [`TrainableOps::preprocess`].
    fn preprocess_supervised(&self, doc: &Document) -> Result<Feature> {
        self.preprocess(doc)
    }

    /// Collate one payload per document into a batch of tensors.
    fn collate(&self, column: &[Feature]) -> Result<TensorMap>;

    /// The forward pass over a collated batch.
    fn forward(&self, inputs: &TensorMap) -> Result<TensorMap>;

    /// Write predictions back onto the documents. Defaults to returning the
    /// documents unchanged.
    fn postprocess(&self, docs: Vec<Document>, _outputs: &TensorMap) -> Result<Vec<Document>> {
        Ok(docs)
    }

    /// This component's own learnable parameters with dotted paths.
    ///
    /// Implementations return only their direct parameters; parameters of
    /// nested subcomponents are aggregated by the wrapping pipe, prefixed
    /// with the subcomponent name.
    fn named_parameters(&self) -> Vec<(String, Parameter)> {
        Vec::new()
    }

    /// Nested trainable subcomponents, shared or owned.
    fn subcomponents(&self) -> Vec<Arc<TrainablePipe>> {
        Vec::new()
    }

    /// The scorer for this component, if it participates in evaluation.
    fn scorer(&self) -> Option<&dyn Scorer> {
        None
    }

    /// Strip from a gold document the annotations this component is
    /// expected to predict, before it runs during evaluation. Defaults to
    /// leaving the document untouched.
    fn clean_gold_for_evaluation(&self, doc: Document) -> Document {
        doc
    }

    /// Complete initialization from gold data (vocabulary construction and
    /// the like). Defaults to a no-op.
    fn post_init(&self, _docs: &[Document]) -> Result<()> {
        Ok(())
    }

    /// Move this component's tensors to a device. Explicit and idempotent;
    /// defaults to a no-op.
    fn to_device(&self, _device: Device) -> Result<()> {
        Ok(())
    }

    /// Optional disk round-trip hook for non-tensor state.
    fn disk_hook(&self) -> Option<&dyn DiskHook> {
        None
    }
}

/// Initialize an optional attribute during `post_init`.
///
/// A `None` value leaves the slot untouched. A value conflicting with an
/// already-initialized slot is a configuration error, never silently
/// resolved.
pub fn init_attribute<T: PartialEq + std::fmt::Debug>(
    name: &str,
    slot: &mut Option<T>,
    value: Option<T>,
) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    match slot {
        Some(current) if *current != value => Err(PipelineError::Config {
            message: format!(
                "cannot initialize attribute '{name}' with conflicting values: {current:?} != {value:?}"
            ),
        }),
        _ => {
            *slot = Some(value);
            Ok(())
        },
    }
}
