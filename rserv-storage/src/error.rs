use rserv_api::DocId;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt json in {path}: {source}")]
    CorruptJson {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid entity name: {0}")]
    InvalidEntityName(String),

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("document {entity}/{id} not found")]
    NotFound { entity: String, id: DocId },

    #[error("document {entity}/{id} already exists")]
    IdExists { entity: String, id: DocId },

    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("document {entity}/{id} is referenced by {referrers} document(s)")]
    ReferencedDelete {
        entity: String,
        id: DocId,
        referrers: usize,
    },

    #[error("allocator file {0} is corrupt")]
    AllocatorCorrupt(PathBuf),

    #[error("graph index corrupt: {0}")]
    IndexCorrupt(&'static str),

    #[error("bad schema {path}: {message}")]
    BadSchema { path: PathBuf, message: String },
}
