//! bwprobe: the bandwidth/RTT/jitter/loss probe protocol used by `fbforward`
//! to score its upstreams. A session is a JSON-RPC control connection over
//! TCP; data is pushed either on the same TCP connection (mode byte `DATA`)
//! or over a companion UDP socket registered via `udp.register`.

pub mod client;
pub mod error;
pub mod rpc;
pub mod rtt;
pub mod server;
pub mod session;
pub mod stats;

pub use error::{Error, Result};
pub use server::ProbeServer;
pub use session::ProbeSession;
