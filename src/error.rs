//! Error taxonomy for the cataloging engine.
//!
//! Registration and resolution failures surface to the caller. Everything
//! inside the scan and drain loops is logged and skipped instead; those
//! paths only use these variants to describe what went wrong.

use thiserror::Error;

use crate::extract::ExtractError;

pub type Result<T, E = CatalogError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// A source uri could not be classified by the owning processor.
    #[error("source not valid: {uri}: {reason}")]
    SourceInvalid { uri: String, reason: String },

    /// A processor reference does not resolve, or its factory failed.
    #[error("processor '{reference}' failed to load: {message}")]
    ClassFailedToLoad { reference: String, message: String },

    /// No registered processor handles the artifact type.
    #[error("no handler registered for artifact type '{artifact_type}'")]
    NoHandler { artifact_type: String },

    #[error("unknown processor: {0}")]
    UnknownProcessor(String),

    #[error("no cataloged uri with id {0}")]
    UnknownUri(i64),

    #[error("archive {path}: {message}")]
    Archive { path: String, message: String },

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CatalogError {
    pub fn source_invalid(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceInvalid {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    pub fn failed_to_load(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ClassFailedToLoad {
            reference: reference.into(),
            message: message.into(),
        }
    }

    pub fn archive(path: impl std::fmt::Display, message: impl std::fmt::Display) -> Self {
        Self::Archive {
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    /// True when the underlying database error is a unique-constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            CatalogError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}
