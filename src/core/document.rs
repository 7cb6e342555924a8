//! The document: the unit of annotation state flowing through a pipeline.
//!
//! A [`Document`] is owned by the caller for the duration of a pipeline
//! call; components mutate it in place or return an updated value, they
//! never keep it. Cloning a document is a deep copy, which is what the
//! scoring protocol relies on to build an independent prediction stream.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Stable identifier of a document.
///
/// Identity, not content, is what the per-document preprocess cache keys on:
/// the executor maps each id to a scope-local integer handle when a cache
/// scope is open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Create a new document id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A unit of text with its annotation state.
///
/// Annotations are free-form JSON values keyed by name; the annotation
/// algorithms that read and write them live outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identity of this document.
    pub id: DocumentId,
    /// The raw text.
    pub text: String,
    /// Annotation state attached by components, in insertion order.
    pub annotations: IndexMap<String, serde_json::Value>,
}

impl Document {
    /// Create a document with no annotations.
    pub fn new(id: impl Into<DocumentId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            annotations: IndexMap::new(),
        }
    }

    /// Attach or replace an annotation.
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Read an annotation by name.
    pub fn annotation(&self, key: &str) -> Option<&serde_json::Value> {
        self.annotations.get(key)
    }

    /// Remove an annotation, returning it if present.
    ///
    /// Used by `clean_gold_for_evaluation` implementations to strip the
    /// attributes a component is expected to predict.
    pub fn remove_annotation(&mut self, key: &str) -> Option<serde_json::Value> {
        self.annotations.shift_remove(key)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
