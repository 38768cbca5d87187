//! End-to-end bwprobe scenarios: a real `ProbeServer` bound to loopback
//! driven by a real `ProbeClient`, exercising the full RPC control path.

use bwprobe::client::{CancelToken, ProbeClient, RunParams};
use bwprobe::server::{ProbeServer, ServerConfig};
use common::model::{Direction, Protocol};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};

async fn spawn_server() -> std::net::SocketAddr {
    let server = ProbeServer::new(ServerConfig::default());
    let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp_listener.local_addr().unwrap();
    let udp_socket = UdpSocket::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let _ = server.run(tcp_listener, udp_socket).await;
    });
    addr
}

// S1: TCP probe single sample, upload direction. Expect the received byte
// count to match the requested payload within one frame, and a sane
// trimmed_mean <= peak_1s relationship.
#[tokio::test(flavor = "multi_thread")]
async fn s1_tcp_upload_single_sample() {
    let addr = spawn_server().await;

    let params = RunParams {
        target_host: addr.ip().to_string(),
        target_port: addr.port(),
        bandwidth_target_bps: 10_000_000.0,
        chunk_size: 16 * 1024,
        sample_count: 1,
        payload_bytes_per_sample: 1024 * 1024,
        inter_sample_wait: Duration::from_millis(10),
        direction: Direction::Upload,
        protocol: Protocol::Tcp,
        rtt_hint_ms: Some(5.0),
        rtt_sample_rate_hz: 2.0,
    };
    let client = ProbeClient::new(params);
    let result = client
        .run(CancelToken::new(), None)
        .await
        .expect("probe run should succeed");

    assert_eq!(result.samples.len(), 1);
    let sample = &result.samples[0];
    assert!(
        (sample.record.total_bytes as i64 - 1024 * 1024).abs() < 32 * 1024,
        "expected ~1MiB received, got {}",
        sample.record.total_bytes
    );
    assert!(sample.trimmed_mean_bps <= sample.peak_1s_bps + 1.0);
}

// S6-adjacent: a session that never heartbeats gets pruned by the janitor.
// Here we exercise the narrower, deterministic slice: hello then close
// removes the session immediately, and a bogus session id is rejected.
#[tokio::test]
async fn session_close_and_unknown_session_rejected() {
    use bwprobe::rpc::{self, method, RpcRequest, RpcResponse};
    use common::protocol::{read_rpc_message, write_rpc_message, Mode};
    use tokio::net::TcpStream;

    let addr = spawn_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    Mode::Rpc.write(&mut stream).await.unwrap();

    let req = RpcRequest::new(1, method::SESSION_HELLO, serde_json::json!({}));
    write_rpc_message(&mut stream, &serde_json::to_value(&req).unwrap())
        .await
        .unwrap();
    let resp: RpcResponse =
        serde_json::from_value(read_rpc_message(&mut stream).await.unwrap()).unwrap();
    let hello: rpc::SessionHelloResult = serde_json::from_value(resp.result.unwrap()).unwrap();

    let req = RpcRequest::new(
        2,
        method::SESSION_CLOSE,
        serde_json::json!({"session_id": hello.session_id}),
    );
    write_rpc_message(&mut stream, &serde_json::to_value(&req).unwrap())
        .await
        .unwrap();
    let _ = read_rpc_message(&mut stream).await.unwrap();

    // heartbeat against the now-closed session should fail with SESSION_INVALID.
    let req = RpcRequest::new(
        3,
        method::SESSION_HEARTBEAT,
        serde_json::json!({"session_id": hello.session_id}),
    );
    write_rpc_message(&mut stream, &serde_json::to_value(&req).unwrap())
        .await
        .unwrap();
    let resp: RpcResponse =
        serde_json::from_value(read_rpc_message(&mut stream).await.unwrap()).unwrap();
    assert!(resp.error.is_some());
}

// Sample id mismatch on stop surfaces as a typed protocol error, not a panic.
#[tokio::test]
async fn sample_id_mismatch_reported_as_rpc_error() {
    use bwprobe::rpc::{self, method, RpcRequest, RpcResponse};
    use common::protocol::{read_rpc_message, write_rpc_message, Mode};
    use tokio::net::TcpStream;

    let addr = spawn_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    Mode::Rpc.write(&mut stream).await.unwrap();

    let req = RpcRequest::new(1, method::SESSION_HELLO, serde_json::json!({}));
    write_rpc_message(&mut stream, &serde_json::to_value(&req).unwrap())
        .await
        .unwrap();
    let resp: RpcResponse =
        serde_json::from_value(read_rpc_message(&mut stream).await.unwrap()).unwrap();
    let hello: rpc::SessionHelloResult = serde_json::from_value(resp.result.unwrap()).unwrap();

    let req = RpcRequest::new(
        2,
        method::SAMPLE_START,
        serde_json::json!({"session_id": hello.session_id, "protocol": "tcp", "duration_secs": 5}),
    );
    write_rpc_message(&mut stream, &serde_json::to_value(&req).unwrap())
        .await
        .unwrap();
    let _ = read_rpc_message(&mut stream).await.unwrap();

    let req = RpcRequest::new(
        3,
        method::SAMPLE_STOP,
        serde_json::json!({"session_id": hello.session_id, "sample_id": 9999}),
    );
    write_rpc_message(&mut stream, &serde_json::to_value(&req).unwrap())
        .await
        .unwrap();
    let resp: RpcResponse =
        serde_json::from_value(read_rpc_message(&mut stream).await.unwrap()).unwrap();
    let err = resp.error.expect("expected a sample id mismatch error");
    assert_eq!(err.code, bwprobe::error::rpc_code::SAMPLE_MISMATCH);
}
