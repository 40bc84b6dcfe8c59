use std::{path::PathBuf, sync::Arc};

use crate::variant::VariantKind;

/// Represents a result type for operations in the event hub.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the event hub.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A [`Variant`](crate::Variant) could not be read as the requested type.
    #[error(transparent)]
    Variant(#[from] VariantError),

    /// Rule or consequence definition is missing required fields or could not be parsed.
    #[error("malformed definition: {0}")]
    MalformedDefinition(String),

    /// Shared state version was published with a sequence number older than the last version.
    #[error("out-of-order shared state update for {module} (last: {last}, attempted: {attempted})")]
    OutOfOrderUpdate {
        /// Module owning the shared state.
        module: String,
        /// Sequence number of the latest version.
        last: u64,
        /// Sequence number that was rejected.
        attempted: u64,
    },

    /// Pending shared state was already resolved.
    #[error("pending shared state for {module} at {sequence} was already resolved")]
    DuplicateResolution {
        /// Module owning the shared state.
        module: String,
        /// Sequence number of the pending version.
        sequence: u64,
    },

    /// Pending token does not belong to the module or is unknown.
    #[error("unknown pending shared state token for {module}")]
    UnknownPendingToken {
        /// Module the token was presented to.
        module: String,
    },

    /// Path resolves outside of the sandbox or archive output directory.
    #[error("path escapes sandbox: {}", path.display())]
    PathEscape {
        /// Offending path, as supplied.
        path: PathBuf,
    },

    /// Extension with the same name is already registered.
    #[error("extension {0} is already registered")]
    DuplicateExtension(String),

    /// No extension registered under the name.
    #[error("extension {0} is not registered")]
    ExtensionNotFound(String),

    /// The hub dispatcher thread is not running anymore.
    #[error("event hub is shut down")]
    HubShutdown,

    /// The dispatcher thread panicked. This should normally never happen.
    #[error("event hub dispatcher thread panicked")]
    DispatcherPanicked,

    /// No response event arrived before the deadline.
    #[error("timed out waiting for a response event")]
    ResponseTimeout,

    /// Invalid URL.
    #[error("invalid url")]
    InvalidUrl(#[source] url::ParseError),

    /// Server responded with a non-success status code.
    #[error("unexpected http status {0}")]
    HttpStatus(u16),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Backing SQLite store error.
    #[error(transparent)]
    Storage(Arc<rusqlite::Error>),

    /// JSON encoding or decoding error.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Error::Storage(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

/// Failure reading a [`Variant`](crate::Variant) or an [`EventData`](crate::EventData) entry.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VariantError {
    /// Stored kind does not match the requested one.
    #[error("type mismatch (expected: {expected:?}, found: {found:?})")]
    TypeMismatch {
        /// Requested kind.
        expected: VariantKind,
        /// Stored kind.
        found: VariantKind,
    },

    /// Numeric value does not fit the requested type.
    #[error("value out of range for {0:?}")]
    Range(VariantKind),

    /// Key is not present in event data.
    #[error("key not found: {0}")]
    NotFound(String),
}
