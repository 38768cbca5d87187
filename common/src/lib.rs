//! Shared types for the `bwprobe` protocol engine and the `fbforward`
//! forwarder: wire framings, the upstream/flow/sample data model, and the
//! leaky-bucket rate limiter used by every UDP sender in the workspace.

pub mod error;
pub mod model;
pub mod protocol;
pub mod ratelimiter;

pub use error::{Error, Result};
