//! Error taxonomy for the forwarder: configuration failures are rejected at
//! construction time; everything on the data path is either transient (log
//! and continue) or a typed failure surfaced to the control plane.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Probe(#[from] bwprobe::Error),

    #[error(transparent)]
    Wire(#[from] common::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no usable upstream")]
    NoUsableUpstream,

    #[error("unknown upstream tag: {0}")]
    UnknownUpstream(String),
}

pub type Result<T> = std::result::Result<T, Error>;
