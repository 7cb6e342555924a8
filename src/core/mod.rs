//! Core data structures and abstractions for the pipeline runtime
//!
//! This module contains the fundamental types, the error handling and the
//! explicit component registry that power the rest of the crate.

pub mod document;
pub mod error;
pub mod registry;
pub mod tensor;

// Re-export key items for convenience
pub use document::{Document, DocumentId};
pub use error::{PipelineError, Result};
pub use registry::ComponentRegistry;
pub use tensor::{Device, Parameter, Tensor};
