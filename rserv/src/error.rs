use rserv_storage::FieldError;
use std::fmt;
use tracing::error;

/// The error type surfaced at the request boundary. Each variant maps to
/// one error kind and HTTP status of the REST surface.
#[derive(Debug)]
pub enum Error {
    Validation(Vec<FieldError>),
    Integrity { message: String, conflict: bool },
    NotFound(String),
    Conflict(String),
    QuerySyntax {
        message: String,
        token: String,
        line: usize,
        column: usize,
    },
    QueryRuntime(String),
    Timeout(String),
    Storage(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation(vec![FieldError::new(field, message)])
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Integrity { conflict, .. } => {
                if *conflict {
                    409
                } else {
                    400
                }
            }
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::QuerySyntax { .. } => 400,
            Error::QueryRuntime(_) => 400,
            Error::Timeout(_) => 500,
            Error::Storage(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::Integrity { .. } => "IntegrityError",
            Error::NotFound(_) => "NotFound",
            Error::Conflict(_) => "Conflict",
            Error::QuerySyntax { .. } => "QuerySyntaxError",
            Error::QueryRuntime(_) => "QueryRuntimeError",
            Error::Timeout(_) => "TimeoutError",
            Error::Storage(_) => "StorageError",
        }
    }

    /// Field-level details for the error envelope, when there are any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::Validation(errors) => Some(serde_json::json!(errors)),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(errors) => {
                write!(f, "validation failed")?;
                for e in errors {
                    write!(f, "; {}: {}", e.field, e.message)?;
                }
                Ok(())
            }
            Error::Integrity { message, .. } => write!(f, "{message}"),
            Error::NotFound(message) => write!(f, "{message}"),
            Error::Conflict(message) => write!(f, "{message}"),
            Error::QuerySyntax {
                message,
                token,
                line,
                column,
            } => write!(f, "syntax error at {line}:{column} near {token:?}: {message}"),
            Error::QueryRuntime(message) => write!(f, "{message}"),
            Error::Timeout(message) => write!(f, "{message}"),
            Error::Storage(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<rserv_storage::Error> for Error {
    fn from(e: rserv_storage::Error) -> Self {
        use rserv_storage::Error as StorageError;
        match e {
            StorageError::Validation(errors) => Error::Validation(errors),
            StorageError::Integrity(message) => Error::Integrity {
                message,
                conflict: false,
            },
            StorageError::ReferencedDelete { .. } => Error::Integrity {
                message: e.to_string(),
                conflict: true,
            },
            StorageError::NotFound { .. } | StorageError::UnknownEntity(_) => {
                Error::NotFound(e.to_string())
            }
            StorageError::IdExists { .. } => Error::Conflict(e.to_string()),
            StorageError::InvalidEntityName(name) => {
                Error::validation("entity", format!("invalid entity name {name:?}"))
            }
            other => {
                // Full detail goes to the log; callers get a generic 500.
                error!(error = %other, "storage failure");
                Error::Storage("internal storage error".to_string())
            }
        }
    }
}

impl From<rserv_query::Error> for Error {
    fn from(e: rserv_query::Error) -> Self {
        match e {
            rserv_query::Error::Syntax {
                message,
                token,
                line,
                column,
            } => Error::QuerySyntax {
                message,
                token,
                line,
                column,
            },
            rserv_query::Error::Runtime(message) => Error::QueryRuntime(message),
            rserv_query::Error::Timeout => Error::Timeout("query timed out".to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
