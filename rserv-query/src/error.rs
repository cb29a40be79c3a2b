//! Error and result types for the query crate.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Lex or parse failure, with the offending token and position.
    Syntax {
        message: String,
        token: String,
        line: usize,
        column: usize,
    },
    /// Unresolvable variable, bad aggregation argument, type mismatch.
    Runtime(String),
    /// The per-query wall clock expired.
    Timeout,
}

impl Error {
    pub(crate) fn syntax(
        message: impl Into<String>,
        token: impl Into<String>,
        line: usize,
        column: usize,
    ) -> Self {
        Error::Syntax {
            message: message.into(),
            token: token.into(),
            line,
            column,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Syntax {
                message,
                token,
                line,
                column,
            } => write!(f, "syntax error at {line}:{column} near {token:?}: {message}"),
            Error::Runtime(msg) => write!(f, "{msg}"),
            Error::Timeout => write!(f, "query timed out"),
        }
    }
}

impl std::error::Error for Error {}
