//! Error types for conda-stream.
//!
//! Every fatal failure of a call surfaces as exactly one [`CallError`] through
//! the [`Deferred`](crate::deferred::Deferred) returned by `invoke`. Malformed
//! progress frames are [`FrameError`]s: they are logged and dropped, never
//! returned to the caller.

use std::path::PathBuf;

/// Boxed error used for transport failures of either kind.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = CallError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The subprocess could not be spawned or the connection could not be opened.
    #[error("failed to start transport to {target}: {source}")]
    TransportStart {
        target: String,
        #[source]
        source: BoxError,
    },

    /// The transport failed after it was started.
    #[error("transport failed: {0}")]
    Transport(#[source] BoxError),

    /// The final output did not parse as one JSON document.
    #[error("malformed result ({} bytes buffered): {source}", .raw.len())]
    MalformedResult {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    /// The call was cancelled, or the channel closed, before it settled.
    #[error("call was cancelled before it settled")]
    Cancelled,

    /// The relay on the other end of a channel reported a failure.
    #[error("remote call failed: {message}")]
    Remote { message: String },
}

impl CallError {
    pub(crate) fn transport_start(target: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::TransportStart {
            target: target.into(),
            source: source.into(),
        }
    }

    pub(crate) fn transport(source: impl Into<BoxError>) -> Self {
        Self::Transport(source.into())
    }

    /// Raw buffered output, if this is a malformed result.
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            Self::MalformedResult { raw, .. } => Some(raw),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A single progress frame that failed to parse.
#[derive(Debug, thiserror::Error)]
#[error("malformed progress frame: {source}")]
pub struct FrameError {
    pub raw: String,
    #[source]
    pub source: serde_json::Error,
}

impl FrameError {
    pub(crate) fn new(raw: &[u8], source: serde_json::Error) -> Self {
        Self {
            raw: String::from_utf8_lossy(raw).into_owned(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
