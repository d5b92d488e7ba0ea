// rust/shardmill-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardmillError {

    #[error("Store unavailable at '{path}': {message}")]
    StoreUnavailable {
        path: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Object not found: '{path}'")]
    NotFound {
        path: String,
    },

    #[error("Stamp error at '{path}': {message}")]
    Stamp {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Annotator error: {message}")]
    Annotator {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Layout error: {message}")]
    Layout {
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, ShardmillError>;

// Convenience constructors
impl ShardmillError {

    pub fn store(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn store_with_source(
        path: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StoreUnavailable {
            path: path.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn stamp(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Stamp {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn stamp_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Stamp {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn annotator_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Annotator {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn layout(message: impl Into<String>) -> Self {
        Self::Layout {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true for failures a caller may retry wholesale (network, auth,
    /// throttling). Everything else needs a change of input or configuration.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Returns true if this error reports a missing remote object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
