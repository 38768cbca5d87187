//! Shared error type for the protocol codec, data model and rate limiter.

use thiserror::Error;

/// Errors that can occur while encoding, decoding or accounting wire traffic.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame exceeded the protocol's maximum accepted size
    #[error("frame too large: {len} bytes exceeds max {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Unrecognized mode header / packet type byte
    #[error("unknown wire tag: {0:?}")]
    UnknownTag(Vec<u8>),

    /// Malformed frame (truncated, bad length, etc.)
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Session id was not a valid 36-hyphenated or 32-hex UUID
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
}

/// Result type for the `common` crate.
pub type Result<T> = std::result::Result<T, Error>;
