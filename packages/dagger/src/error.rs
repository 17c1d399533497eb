//! Error types for dagger processes.
//!
//! Errors never cross the guest boundary as values. Each one maps to an
//! [`ErrorKind`] whose negated errno is what the guest sees.

use thiserror::Error;

use crate::memory::OutOfBounds;

/// Stable error categories exposed to guests.
///
/// The numeric values are part of the ABI: a failed `open` returns
/// `-(kind as i64)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum ErrorKind {
    /// The open URL could not be parsed.
    BadUrl = 1,
    /// The URL parsed but its scheme-specific argument is unusable.
    BadUrlInput = 2,
    /// No resolver exists for the URL scheme.
    UnknownScheme = 3,
    /// A read, write, flush or close on a valid resource failed.
    Io = 4,
    /// A guest pointer/length pair escapes the guest's linear memory.
    OutOfBounds = 5,
    /// The descriptor is negative, past the end of the table, or closed.
    BadDescriptor = 6,
}

impl ErrorKind {
    /// The positive errno for this kind.
    pub fn errno(self) -> i64 {
        self as i64
    }

    /// The negative return value handed back across the ABI.
    pub fn code(self) -> i64 {
        -self.errno()
    }
}

/// Errors raised by a [`Process`](crate::Process).
#[derive(Debug, Error)]
pub enum DaggerError {
    #[error("bad url {url:?}: {source}")]
    BadUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("bad {scheme} url input: {message}")]
    BadUrlInput { scheme: String, message: String },

    #[error("unknown scheme {0}")]
    UnknownScheme(String),

    #[error("{op} on descriptor {fd}: {source}")]
    Io {
        op: &'static str,
        fd: usize,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    OutOfBounds(#[from] OutOfBounds),

    #[error("bad descriptor {0}")]
    BadDescriptor(i64),
}

impl DaggerError {
    pub(crate) fn bad_input(scheme: &str, message: impl std::fmt::Display) -> Self {
        DaggerError::BadUrlInput {
            scheme: scheme.to_string(),
            message: message.to_string(),
        }
    }

    /// The ABI category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaggerError::BadUrl { .. } => ErrorKind::BadUrl,
            DaggerError::BadUrlInput { .. } => ErrorKind::BadUrlInput,
            DaggerError::UnknownScheme(_) => ErrorKind::UnknownScheme,
            DaggerError::Io { .. } => ErrorKind::Io,
            DaggerError::OutOfBounds(_) => ErrorKind::OutOfBounds,
            DaggerError::BadDescriptor(_) => ErrorKind::BadDescriptor,
        }
    }

    /// Shorthand for `self.kind().code()`.
    pub fn code(&self) -> i64 {
        self.kind().code()
    }
}

/// Result type alias for dagger operations.
pub type Result<T> = std::result::Result<T, DaggerError>;
