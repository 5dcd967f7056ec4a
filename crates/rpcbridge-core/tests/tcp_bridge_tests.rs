//! End-to-end tests for the TCP bridge.

use rpcbridge::{
    engine_factory, DispatchEngine, RequestContext, RpcDispatch, RpcError, TcpBridge,
    TcpBridgeConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

struct EchoMethods;

#[async_trait::async_trait]
impl RpcDispatch for EchoMethods {
    async fn dispatch(
        &self,
        _ctx: &RequestContext,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        match method {
            "ping" => Ok(json!("pong")),
            "echo" => Ok(params),
            _ => Err(RpcError::method_not_found(method)),
        }
    }
}

async fn start_bridge() -> (TcpBridge, std::net::SocketAddr) {
    let config = TcpBridgeConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    let factory =
        engine_factory(|transport| DispatchEngine::new(transport, Arc::new(EchoMethods)));
    let bridge = TcpBridge::new(config, factory).unwrap();
    let addr = bridge.start().await.unwrap();
    (bridge, addr)
}

#[tokio::test]
async fn test_round_trip_over_socket() {
    let (bridge, addr) = start_bridge().await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
        .await
        .unwrap();
    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(line, r#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#);

    let echo = json!({"jsonrpc": "2.0", "id": "e", "method": "echo", "params": {"k": "\u{e9}"}});
    writer
        .write_all(format!("{}\n", echo).as_bytes())
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["result"]["k"], "\u{e9}");

    drop(writer);
    assert!(lines.next_line().await.unwrap().is_none());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_half_close_flushes_pending_replies() {
    let (bridge, addr) = start_bridge().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let batch: String = (1..=3)
        .map(|i| format!("{{\"jsonrpc\":\"2.0\",\"id\":{},\"method\":\"ping\"}}\n", i))
        .collect();
    stream.write_all(batch.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut received = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut received))
        .await
        .unwrap()
        .unwrap();

    let mut ids: Vec<i64> = received
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap()["id"].as_i64().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_each_connection_gets_its_own_engine() {
    let (bridge, addr) = start_bridge().await;

    let mut a = BufReader::new(TcpStream::connect(addr).await.unwrap());
    let mut b = BufReader::new(TcpStream::connect(addr).await.unwrap());

    a.get_mut()
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"echo\",\"params\":\"a\"}\n")
        .await
        .unwrap();
    b.get_mut()
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"echo\",\"params\":\"b\"}\n")
        .await
        .unwrap();

    let mut line_a = String::new();
    let mut line_b = String::new();
    a.read_line(&mut line_a).await.unwrap();
    b.read_line(&mut line_b).await.unwrap();
    assert!(line_a.contains(r#""result":"a""#));
    assert!(line_b.contains(r#""result":"b""#));

    drop(a);
    drop(b);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let (bridge, addr) = start_bridge().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Let the accept loop pick the connection up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.active_connections(), 1);

    tokio::time::timeout(Duration::from_secs(5), bridge.shutdown())
        .await
        .unwrap();

    let mut buf = Vec::new();
    let n = stream.read_to_end(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(bridge.active_connections(), 0);
}

#[tokio::test]
async fn test_stop_keeps_established_connections() {
    let (bridge, addr) = start_bridge().await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    assert!(line.contains(r#""id":1"#));

    bridge.stop();
    tokio::time::timeout(Duration::from_secs(5), async {
        while bridge.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(TcpStream::connect(addr).await.is_err());

    writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n")
        .await
        .unwrap();
    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(line, r#"{"jsonrpc":"2.0","id":2,"result":"pong"}"#);
    assert_eq!(bridge.active_connections(), 1);

    drop(writer);
    assert!(lines.next_line().await.unwrap().is_none());
    bridge.shutdown().await;
}
