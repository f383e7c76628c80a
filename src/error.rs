use serde::Serialize;
use thiserror::Error;

use crate::archive::Codec;

/// Result type alias for placy operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Container structure (central directory, headers) cannot be read
    #[error("malformed {format} container: {message}")]
    MalformedContainer {
        format: &'static str,
        message: String,
    },

    /// Compression stream could not be decoded or re-encoded
    #[error("{codec} stream failed: {source}")]
    Codec {
        codec: Codec,
        #[source]
        source: std::io::Error,
    },

    /// Class file section is truncated or uses an unknown constant-pool tag
    #[error("malformed class file at offset {offset}: {reason}")]
    MalformedClassFile { offset: usize, reason: String },

    #[error("invalid placeholder map: {0}")]
    InvalidPlaceholders(String),

    #[error("unsupported charset '{0}'")]
    UnsupportedCharset(String),

    /// Nested containers deeper than the configured limit
    #[error("container nesting exceeds the limit of {limit}")]
    DepthExceeded { limit: usize },

    #[error("worker pool: {0}")]
    Pool(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedContainer,
    Codec,
    MalformedClassFile,
    InvalidPlaceholders,
    UnsupportedCharset,
    DepthExceeded,
    Pool,
    Io,
}

impl Error {
    pub fn malformed_container(format: &'static str, message: impl Into<String>) -> Self {
        Self::MalformedContainer {
            format,
            message: message.into(),
        }
    }

    pub fn codec(codec: Codec, source: std::io::Error) -> Self {
        Self::Codec { codec, source }
    }

    pub fn malformed_class_file(offset: usize, reason: impl Into<String>) -> Self {
        Self::MalformedClassFile {
            offset,
            reason: reason.into(),
        }
    }

    pub fn pool(msg: impl Into<String>) -> Self {
        Self::Pool(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedContainer { .. } => ErrorKind::MalformedContainer,
            Self::Codec { .. } => ErrorKind::Codec,
            Self::MalformedClassFile { .. } => ErrorKind::MalformedClassFile,
            Self::InvalidPlaceholders(_) => ErrorKind::InvalidPlaceholders,
            Self::UnsupportedCharset(_) => ErrorKind::UnsupportedCharset,
            Self::DepthExceeded { .. } => ErrorKind::DepthExceeded,
            Self::Pool(_) => ErrorKind::Pool,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Returns true if the failing unit can pass through unchanged instead of aborting
    /// the surrounding request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedClassFile { .. } | Self::DepthExceeded { .. } | Self::Pool(_)
        )
    }
}
