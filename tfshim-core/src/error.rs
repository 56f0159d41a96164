use thiserror::Error;

use crate::paths::AttributePath;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced while shimming legacy state into structural values and back.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("unknown resource type {0:?}")]
    UnknownResourceType(String),

    /// Malformed input: bad counts, invalid JSON, msgpack that does not match the type.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// A primitive leaf could not be converted to or from its declared type.
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("cannot upgrade state, {0}")]
    Migration(String),

    #[error("failed to migrate legacy state")]
    MigrateFunction(#[source] BoxError),

    #[error("state upgrade from schema version {version} failed")]
    StateUpgrade {
        version: i64,
        #[source]
        source: BoxError,
    },

    #[error("invalid timeouts: {0}")]
    InvalidTimeout(String),

    #[error("{path}: {message}")]
    Coercion { path: AttributePath, message: String },

    #[error("diff apply conflict for {key}: diff expects {expected:?}, but prior value has {actual:?}")]
    ApplyConflict {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("resource provider error")]
    Provider(#[source] BoxError),
}

impl ShimError {
    pub(crate) fn decoding(message: impl Into<String>) -> Self {
        ShimError::Decoding(message.into())
    }

    pub(crate) fn encoding(message: impl Into<String>) -> Self {
        ShimError::Encoding(message.into())
    }

    pub(crate) fn coercion(path: &AttributePath, message: impl Into<String>) -> Self {
        ShimError::Coercion {
            path: path.clone(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = ShimError> = std::result::Result<T, E>;
