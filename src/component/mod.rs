//! The component model.
//!
//! A pipeline step is either *rule-based* (a pure `Document -> Document`
//! function) or *trainable* (the preprocess/collate/forward/postprocess
//! lifecycle with learnable parameters). The capability is an explicit tag
//! on [`Component`]; the executor dispatches on the variant rather than
//! probing for methods.

pub mod cached;
pub mod trainable;

use std::sync::Arc;

use crate::core::document::Document;
use crate::core::error::Result;
use crate::persistence::DiskHook;

pub use cached::{CacheScope, CacheStage, TrainablePipe};
pub use trainable::{Scorer, StageError, TensorMap, TrainableOps};

/// A rule-based component: a pure function over documents.
///
/// The evaluation and initialization hooks are optional exactly as they are
/// for trainable components; the defaults mean "skip this component".
pub trait RuleComponent: Send + Sync {
    /// Apply the rule to one document.
    fn apply(&self, doc: Document) -> Result<Document>;

    /// Optional disk round-trip hook; `None` means this component has no
    /// persisted state and its subdirectory is skipped on save/load.
    fn disk_hook(&self) -> Option<&dyn DiskHook> {
        None
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

    /// Complete initialization from gold data. Defaults to a no-op.
    fn post_init(&self, _docs: &[Document]) -> Result<()> {
        Ok(())
    }
}

impl<F> RuleComponent for F
where
    F: Fn(Document) -> Result<Document> + Send + Sync,
{
    fn apply(&self, doc: Document) -> Result<Document> {
        self(doc)
    }
}

/// A pipeline component, tagged by capability.
pub enum Component {
    /// Rule-based: applied document by document.
    Rule(Box<dyn RuleComponent>),
    /// Trainable: applied batch by batch through its caching wrapper.
    /// The `Arc` lets several parents share one child by reference.
    Trainable(Arc<TrainablePipe>),
}

impl Component {
    /// Whether this component carries learnable parameters.
    pub fn is_trainable(&self) -> bool {
        matches!(self, Component::Trainable(_))
    }

    /// The trainable pipe, if this component is trainable.
    pub fn as_trainable(&self) -> Option<&Arc<TrainablePipe>> {
        match self {
            Component::Trainable(pipe) => Some(pipe),
            Component::Rule(_) => None,
        }
    }

    /// The disk hook exposed by this component, if any.
    pub fn disk_hook(&self) -> Option<&dyn DiskHook> {
        match self {
            Component::Rule(rule) => rule.disk_hook(),
            Component::Trainable(pipe) => pipe.ops().disk_hook(),
        }
    }

    /// The scorer exposed by this component, if any.
    pub fn scorer(&self) -> Option<&dyn Scorer> {
        match self {
            Component::Rule(rule) => rule.scorer(),
            Component::Trainable(pipe) => pipe.ops().scorer(),
        }
    }

    /// Strip from a gold document the annotations this component is
    /// expected to predict.
    pub fn clean_gold_for_evaluation(&self, doc: Document) -> Document {
        match self {
            Component::Rule(rule) => rule.clean_gold_for_evaluation(doc),
            Component::Trainable(pipe) => pipe.ops().clean_gold_for_evaluation(doc),
        }
    }

    /// Complete initialization from gold documents.
    pub fn post_init(&self, docs: &[Document]) -> Result<()> {
        match self {
            Component::Rule(rule) => rule.post_init(docs),
            Component::Trainable(pipe) => pipe.ops().post_init(docs),
        }
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Rule(_) => write!(f, "Component::Rule"),
            Component::Trainable(pipe) => write!(f, "Component::Trainable({})", pipe.name()),
        }
    }
}
