use std::io;

/// Raised by an [`Inspector`](crate::Inspector) when a packet fails authentication.
///
/// The connection that produced the packet is closed and the rest of the decoded batch is
/// discarded.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("authentication failed for {connection_id}: {reason}")]
pub struct AuthenticationFailure {
    /// Connection id at the time of the failure
    pub connection_id: String,
    /// Human-readable reason
    pub reason: String,
}

impl AuthenticationFailure {
    /// Creates a new authentication failure.
    pub fn new(connection_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            reason: reason.into(),
        }
    }
}

/// Errors produced by portico components.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Socket or channel level IO failure
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Operation attempted on a closed connection
    #[error("connection is closed")]
    Closed,

    /// The inbound byte stream could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// A packet could not be encoded
    #[error("encode error: {0}")]
    Encode(String),

    /// A packet failed authentication
    #[error(transparent)]
    Authentication(#[from] AuthenticationFailure),

    /// A listener update tried to change a property that requires rebinding
    #[error("listener {id}: property `{property}` cannot be changed without rebinding")]
    UnchangeableProperty {
        /// Listener id
        id: String,
        /// Name of the rejected property
        property: &'static str,
    },

    /// A change referenced a listener that is not bound
    #[error("unknown listener {0}")]
    UnknownListener(String),

    /// A codec, inspector or handler could not be constructed
    #[error("failed to construct {kind} `{tag}`: {reason}")]
    Construction {
        /// Component kind (`codec`, `inspector`, `handler`)
        kind: &'static str,
        /// Component type tag
        tag: String,
        /// Why construction failed
        reason: String,
    },

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type used across portico.
pub type Result<T> = std::result::Result<T, Error>;
