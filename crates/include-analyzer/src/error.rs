//! The error taxonomy of the analyzer.
//!
//! Three kinds of failure exist. A *not-covered* error means the analyzer
//! cannot guarantee a correct closure for the current command; the caller
//! falls back to running the real preprocessor locally and the analyzer keeps
//! serving. A *timeout* is a not-covered error that additionally flushes all
//! caches, on the theory that memoization has pathologically blown up. A
//! *fatal* error terminates the analyzer.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The command cannot be analyzed soundly; preprocess locally instead.
    #[error("{reason}")]
    NotCovered {
        reason: String,
        /// The source file the failure was detected in, when known.
        source_file: Option<String>,
    },

    /// The per-request user-time quota was exceeded.
    #[error("spent more than {quota:?} handling request")]
    Timeout { quota: Duration },

    /// Internal invariant violation or unrecoverable I/O failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn not_covered(reason: impl Into<String>) -> Self {
        Error::NotCovered {
            reason: reason.into(),
            source_file: None,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Error::Fatal(reason.into())
    }

    /// Decorate a not-covered error with the file it was detected in.
    ///
    /// The first decoration wins: an error re-raised through several parse
    /// layers keeps the innermost file name.
    pub fn with_file(self, file: &str) -> Self {
        match self {
            Error::NotCovered {
                reason,
                source_file: None,
            } => Error::NotCovered {
                reason: format!("File: '{file}': {reason}"),
                source_file: Some(file.to_owned()),
            },
            other => other,
        }
    }

    /// Whether the analyzer may keep serving requests after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_file_decorates_once() {
        let err = Error::not_covered("bad directive").with_file("a.h").with_file("a.c");
        match err {
            Error::NotCovered { reason, source_file } => {
                assert_eq!(reason, "File: 'a.h': bad directive");
                assert_eq!(source_file.as_deref(), Some("a.h"));
            }
            _ => panic!("expected NotCovered"),
        }
    }

    #[test]
    fn fatal_is_not_recoverable() {
        assert!(!Error::fatal("boom").is_recoverable());
        assert!(Error::not_covered("x").is_recoverable());
        assert!(
            Error::Timeout {
                quota: Duration::from_secs(4)
            }
            .is_recoverable()
        );
    }
}
