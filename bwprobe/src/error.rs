//! Error types for the bwprobe protocol engine.

use thiserror::Error;

/// JSON-RPC application error codes used by the `sample.*`/`udp.*` methods.
pub mod rpc_code {
    pub const SESSION_INVALID: i64 = -32000;
    pub const SESSION_EXPIRED: i64 = -32001;
    pub const SAMPLE_MISMATCH: i64 = -32002;
    pub const SAMPLE_ALREADY_ACTIVE: i64 = -32003;
    pub const UDP_NOT_REGISTERED: i64 = -32004;
    pub const INVALID_PARAMS_RANGE: i64 = -32005;
    pub const REVERSE_NOT_READY: i64 = -32006;
    pub const UNKNOWN_METHOD: i64 = -32007;
}

/// Errors that can occur in the bwprobe client or server.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wire framing error (malformed frame, oversize, unknown tag)
    #[error("protocol error: {0}")]
    Protocol(#[from] common::Error),

    /// The active sample id did not match the id given on `sample.stop`
    #[error("sample id mismatch: active={active:?}, got={got}")]
    SampleIdMismatch { active: Option<u32>, got: u32 },

    /// `sample.start` was called while a sample was already active
    #[error("a sample is already active on this session")]
    SampleAlreadyActive,

    /// Session was not found (never created, or already closed)
    #[error("session not found: {0}")]
    SessionInvalid(String),

    /// Session has not sent a heartbeat within the expiry window
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// `udp.register` was received without a recent validating PING
    #[error("UDP client not registered: {0}")]
    UdpNotRegistered(String),

    /// A run-time parameter was outside its accepted range
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The reverse data connection did not arrive within its wait window
    #[error("reverse connection not ready within timeout")]
    ReverseNotReady,

    /// A probe run missed its deadline or exceeded consecutive read timeouts
    #[error("probe run timed out: {0}")]
    Timeout(String),

    /// The run was cancelled by the caller
    #[error("probe run cancelled")]
    Cancelled,

    /// An error response received from a remote peer, kept as-is rather
    /// than reconstructed into a local variant.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },
}

impl Error {
    /// Map to a JSON-RPC application error code for the `sample.*`/`udp.*`
    /// methods.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Error::SessionInvalid(_) => rpc_code::SESSION_INVALID,
            Error::SessionExpired(_) => rpc_code::SESSION_EXPIRED,
            Error::SampleIdMismatch { .. } => rpc_code::SAMPLE_MISMATCH,
            Error::SampleAlreadyActive => rpc_code::SAMPLE_ALREADY_ACTIVE,
            Error::UdpNotRegistered(_) => rpc_code::UDP_NOT_REGISTERED,
            Error::InvalidParameter(_) => rpc_code::INVALID_PARAMS_RANGE,
            Error::ReverseNotReady => rpc_code::REVERSE_NOT_READY,
            Error::Remote { code, .. } => *code,
            _ => rpc_code::SESSION_INVALID,
        }
    }
}

/// Result type for the `bwprobe` crate.
pub type Result<T> = std::result::Result<T, Error>;
