//! JSON-RPC 2.0 envelope and method payloads for the bwprobe control
//! channel: `session.hello`, `session.heartbeat`, `session.close`,
//! `server.info`, `ping`, `udp.register`, `sample.start`,
//! `sample.start_reverse`, `sample.stop`.

use common::model::{Protocol, SampleMetricRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHelloParams {
    #[serde(default)]
    pub client_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHelloResult {
    pub session_id: String,
    pub heartbeat_interval_ms: u64,
    pub session_expiry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionScopedParams {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfoResult {
    pub server_version: String,
    pub max_sample_duration_secs: u64,
    pub max_udp_packet: usize,
    pub max_tcp_frame_payload: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpRegisterParams {
    pub session_id: String,
    pub client_udp_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleStartParams {
    pub session_id: String,
    pub protocol: Protocol,
    pub duration_secs: u64,
    #[serde(default)]
    pub rate_limit_bps: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleStartResult {
    pub sample_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleStopParams {
    pub session_id: String,
    pub sample_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleStopResult {
    #[serde(flatten)]
    pub record: SampleMetricRecord,
}

pub mod method {
    pub const SESSION_HELLO: &str = "session.hello";
    pub const SESSION_HEARTBEAT: &str = "session.heartbeat";
    pub const SESSION_CLOSE: &str = "session.close";
    pub const SERVER_INFO: &str = "server.info";
    pub const PING: &str = "ping";
    pub const UDP_REGISTER: &str = "udp.register";
    pub const SAMPLE_START: &str = "sample.start";
    pub const SAMPLE_START_REVERSE: &str = "sample.start_reverse";
    pub const SAMPLE_STOP: &str = "sample.stop";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let req = RpcRequest::new(1, method::SESSION_HELLO, serde_json::json!({}));
        let s = serde_json::to_string(&req).unwrap();
        let back: RpcRequest = serde_json::from_str(&s).unwrap();
        assert_eq!(back.method, method::SESSION_HELLO);
    }

    #[test]
    fn error_response_carries_code() {
        let resp = RpcResponse::err(serde_json::json!(1), -32000, "session not found");
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, -32000);
    }
}
