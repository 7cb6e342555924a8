//! # annopipe
//!
//! Execution and caching engine for composable text-annotation pipelines.
//!
//! This crate provides the runtime that drives ordered lists of annotation
//! components over streams of documents:
//!
//! - Stage-level memoization so that components sharing a subcomponent pay
//!   for each shared computation exactly once per pass
//! - Batch compression that deduplicates structurally identical per-document
//!   feature payloads before collation
//! - A streaming batch-execution protocol with strict ordering guarantees
//!   and scoped train/eval mode switching
//! - Shared-tensor persistence that collapses parameters shared by reference
//!   across components into a single on-disk record
//!
//! The natural-language annotation algorithms themselves are external
//! collaborators: rule-based components are plain `Document -> Document`
//! functions, trainable components implement the
//! preprocess/collate/forward/postprocess lifecycle.
//!
//! ## Quick start
//!
//! ```ignore
//! use annopipe::{Pipeline, Component};
//!
//! let mut nlp = Pipeline::new("en");
//! nlp.add_pipe("matcher", Component::Rule(Box::new(my_matcher)))?;
//! nlp.add_pipe("ner", Component::Trainable(ner_pipe))?;
//!
//! for doc in nlp.apply_stream(docs, None) {
//!     let doc = doc?;
//!     // ...
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Core types: documents, tensors, errors, the component registry
pub mod core;

/// Pipeline configuration loading and validation
pub mod config;

/// Feature payloads, structural hashing and batch compression
pub mod batch;

/// Component model: rule-based and trainable components, stage caching
pub mod component;

/// The pipeline executor: single-document and streaming application, scoring
pub mod pipeline;

/// On-disk pipeline layout and shared-tensor persistence
pub mod persistence;

pub use crate::component::{
    cached::{CacheScope, CacheStage, TrainablePipe},
    trainable::{StageError, TensorMap, TrainableOps},
    Component, RuleComponent,
};
pub use crate::config::PipelineConfig;
pub use crate::core::{
    document::{Document, DocumentId},
    error::{PipelineError, Result},
    registry::ComponentRegistry,
    tensor::{Device, Parameter, Tensor},
};
pub use crate::pipeline::{scoring::ScoreOrder, Pipeline};

/// Commonly used items, for glob import in application code.
pub mod prelude {
    pub use crate::batch::{compress::CompressedBatch, Feature, FeatureBatch};
    pub use crate::component::{
        cached::{CacheScope, CacheStage, TrainablePipe},
        trainable::{Scorer, StageError, TensorMap, TrainableOps},
        Component, RuleComponent,
    };
    pub use crate::config::PipelineConfig;
    pub use crate::core::{
        document::{Document, DocumentId},
        error::{PipelineError, Result},
        registry::ComponentRegistry,
        tensor::{Device, Parameter, Tensor},
    };
    pub use crate::persistence::DiskHook;
    pub use crate::pipeline::{scoring::ScoreOrder, Pipeline};
}
