//! Unified error handling for the pipeline runtime
//!
//! This module provides a centralized error type that encompasses all
//! errors that can occur while configuring, running, scoring or persisting
//! a pipeline.

use std::fmt;

/// Main error type for the pipeline runtime
#[derive(Debug)]
pub enum PipelineError {
    /// Configuration-related errors (missing or duplicate component names,
    /// conflicting initialization values). Never silently resolved.
    Config {
        /// Error message
        message: String,
    },

    /// A component failed while processing documents
    Component {
        /// Name of the failing component
        name: String,
        /// Error message
        message: String,
    },

    /// A trainable stage (preprocess/collate/forward/postprocess) failed
    Stage(crate::component::trainable::StageError),

    /// Save/load integrity errors (foreign directory, malformed record)
    Persistence {
        /// Error message
        message: String,
    },

    /// Scoring protocol errors
    Scoring {
        /// Error message
        message: String,
    },

    /// Resource not found errors
    NotFound {
        /// Resource type
        resource: String,
        /// Resource identifier
        id: String,
    },

    /// Already exists errors
    AlreadyExists {
        /// Resource type
        resource: String,
        /// Resource identifier
        id: String,
    },

    /// I/O errors from file operations
    Io(std::io::Error),

    /// JSON serialization errors
    SerdeJson(serde_json::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Config { message } => {
                write!(
                    f,
                    "Configuration error: {message}. \
                     Solution: check the pipeline config and component names"
                )
            },
            PipelineError::Component { name, message } => {
                write!(f, "Component '{name}' failed: {message}")
            },
            PipelineError::Stage(err) => write!(f, "{err}"),
            PipelineError::Persistence { message } => {
                write!(f, "Persistence error: {message}")
            },
            PipelineError::Scoring { message } => {
                write!(f, "Scoring error: {message}")
            },
            PipelineError::NotFound { resource, id } => {
                write!(f, "{resource} not found: {id}")
            },
            PipelineError::AlreadyExists { resource, id } => {
                write!(f, "{resource} already exists: {id}")
            },
            PipelineError::Io(err) => {
                write!(
                    f,
                    "I/O error: {err}. \
                     Solution: check file permissions and that paths exist"
                )
            },
            PipelineError::SerdeJson(err) => {
                write!(f, "JSON serialization error: {err}")
            },
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io(err) => Some(err),
            PipelineError::SerdeJson(err) => Some(err),
            PipelineError::Stage(err) => Some(err),
            _ => None,
        }
    }
}

// Automatic conversions from common error types
impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::SerdeJson(err)
    }
}

impl From<crate::component::trainable::StageError> for PipelineError {
    fn from(err: crate::component::trainable::StageError) -> Self {
        PipelineError::Stage(err)
    }
}

/// Convenient Result type alias
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Creates a configuration error with a message
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::PipelineError::Config {
            message: $msg.to_string(),
        }
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::PipelineError::Config {
            message: format!($fmt, $($arg)*),
        }
    };
}

/// Creates a persistence error with a message
#[macro_export]
macro_rules! persistence_error {
    ($msg:expr) => {
        $crate::PipelineError::Persistence {
            message: $msg.to_string(),
        }
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::PipelineError::Persistence {
            message: format!($fmt, $($arg)*),
        }
    };
}
