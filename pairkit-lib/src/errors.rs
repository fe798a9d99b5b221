//! Error types for pairkit protocol operations.
//!
//! The taxonomy distinguishes frame-local failures (envelope authentication,
//! key lookup) from handshake-level failures (role mismatch, permission
//! mismatch) and store-level invariant violations. None of these are
//! process-fatal: the worst outcome is a dropped frame or a failed handshake,
//! both recoverable by re-proposing.

/// Result type for pairkit protocol operations.
pub type Result<T> = std::result::Result<T, PairkitError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PairkitError {
    /// A connection URI could not be parsed.
    #[error("malformed connection URI: {0}")]
    MalformedUri(String),

    /// Both peers claim the same controller role. Exactly one side of a
    /// pair may hold controller authority.
    #[error("unauthorized matching controller: both peers have controller={0}")]
    UnauthorizedMatchingController(bool),

    /// A sequence already exists for this topic.
    #[error("duplicate topic: {0}")]
    DuplicateTopic(String),

    /// No live sequence exists for this topic.
    #[error("sequence not found for topic: {0}")]
    NotFound(String),

    /// The sequence exists but is in the wrong state for the requested
    /// transition (e.g. responding to an already-settled pairing).
    #[error("invalid sequence state for topic {topic}: {detail}")]
    InvalidSequenceState { topic: String, detail: String },

    /// Envelope MAC verification failed. Fatal to the frame, never retried.
    #[error("envelope authentication failure")]
    AuthenticationFailure,

    /// The requested permissions are not a subset of what was granted.
    #[error("permissions mismatch: requested chains not covered by grant")]
    PermissionsMismatch,

    /// No symmetric key is stored for the topic. Downstream this means the
    /// sequence does not exist.
    #[error("no key material for topic: {0}")]
    KeyNotFound(String),

    /// A handshake round trip did not complete within its validity window.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Proposal or request parameters failed validation.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The caller lacks authority for the operation (e.g. a non-controller
    /// updating session parameters).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The peer requested a relay protocol this client does not speak.
    #[error("unsupported relay protocol: {0}")]
    UnsupportedProtocol(String),

    /// An inbound request named a method with no registered handler.
    #[error("unsupported method")]
    UnsupportedMethod,

    /// A wire frame could not be framed or its payload decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Relay transport failure.
    #[error("relay error: {0}")]
    Relay(String),

    /// The peer answered a request with a JSON-RPC error object.
    #[error("peer error {code}: {message}")]
    PeerError { code: i64, message: String },
}

impl PairkitError {
    /// True for failures local to a single frame: the dispatcher logs and
    /// drops the frame rather than surfacing them to any caller.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailure
                | Self::KeyNotFound(_)
                | Self::Codec(_)
                | Self::Serialization(_)
        )
    }

    pub fn invalid_state(topic: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidSequenceState {
            topic: topic.into(),
            detail: detail.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

impl From<serde_json::Error> for PairkitError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
