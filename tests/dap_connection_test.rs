// DAP-dialect connection exercises: envelope shapes, the shared seq
// counter, cancellation as a request, and the adapter handshake.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tether::framing::FrameReader;
use tether::handler::RequestContext;
use tether::{Connection, ConnectionOptions, HandlerError, HandlerOptions, RpcError};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

struct RawAdapter {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl RawAdapter {
    async fn send(&mut self, value: Value) {
        let body = serde_json::to_vec(&value).unwrap();
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);
        self.writer.write_all(&frame).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let payload = tokio::time::timeout(Duration::from_secs(5), self.reader.read_frame())
            .await
            .expect("timed out waiting for a frame")
            .unwrap();
        serde_json::from_slice(&payload).unwrap()
    }
}

fn connected() -> (Arc<Connection>, RawAdapter) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(ours);
    let conn = Connection::new(ConnectionOptions::dap().without_handshake());
    conn.connect(read, write).unwrap();

    let (peer_read, peer_write) = tokio::io::split(theirs);
    (
        conn,
        RawAdapter {
            reader: FrameReader::new(peer_read),
            writer: peer_write,
        },
    )
}

#[tokio::test]
async fn outgoing_request_uses_the_dap_envelope() {
    let (conn, mut adapter) = connected();

    let request = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.send_request("launch", Some(json!({"program": "/bin/true"})), None)
                .await
        })
    };

    let seen = adapter.recv().await;
    assert_eq!(seen["type"], json!("request"));
    assert_eq!(seen["command"], json!("launch"));
    assert_eq!(seen["arguments"]["program"], json!("/bin/true"));
    let seq = seen["seq"].as_i64().unwrap();

    adapter
        .send(json!({
            "seq": 1, "type": "response", "request_seq": seq,
            "success": true, "command": "launch", "body": {"ok": true},
        }))
        .await;

    let body = request.await.unwrap().unwrap();
    assert_eq!(body["ok"], json!(true));
}

#[tokio::test]
async fn event_reaches_a_registered_handler_with_empty_body() {
    let (conn, mut adapter) = connected();

    let seen: Arc<Mutex<Option<Option<Value>>>> = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    conn.registry()
        .register(
            "initialized",
            HandlerOptions::serial(),
            move |body: Option<Value>, _ctx| {
                let sink = sink.clone();
                async move {
                    *sink.lock().unwrap() = Some(body);
                    Ok(())
                }
            },
        )
        .unwrap()
        .detach();

    adapter
        .send(json!({"seq": 7, "type": "event", "event": "initialized"}))
        .await;

    // Round-trip a request so the event has certainly been dispatched.
    let ping = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send_request("threads", None, None).await })
    };
    let seen_req = adapter.recv().await;
    adapter
        .send(json!({
            "seq": 8, "type": "response", "request_seq": seen_req["seq"],
            "success": true, "command": "threads",
        }))
        .await;
    ping.await.unwrap().unwrap();

    // Serial dispatch: the event handler ran before the later traffic.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if seen.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(None));
}

#[tokio::test]
async fn failed_handler_answers_with_the_compatibility_code() {
    let (conn, mut adapter) = connected();
    conn.registry()
        .register("evaluate", HandlerOptions::parallel(), |(): (), _ctx| async move {
            Err::<Value, _>(HandlerError::new("kaput"))
        })
        .unwrap()
        .detach();

    adapter
        .send(json!({"seq": 3, "type": "request", "command": "evaluate"}))
        .await;

    let response = adapter.recv().await;
    assert_eq!(response["type"], json!("response"));
    assert_eq!(response["request_seq"], json!(3));
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["command"], json!("evaluate"));
    assert_eq!(response["message"], json!("kaput"));
    assert_eq!(response["body"]["error"]["id"], json!(500));
}

#[tokio::test]
async fn unknown_command_is_answered() {
    let (_conn, mut adapter) = connected();

    adapter
        .send(json!({"seq": 4, "type": "request", "command": "restartFrame"}))
        .await;

    let response = adapter.recv().await;
    assert_eq!(response["request_seq"], json!(4));
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["body"]["error"]["id"], json!(-32601));
}

#[tokio::test]
async fn inbound_cancel_request_trips_the_execution() {
    let (conn, mut adapter) = connected();
    conn.registry()
        .register(
            "slow",
            HandlerOptions::parallel(),
            |(): (), ctx: RequestContext| async move {
                ctx.cancel.cancelled().await;
                Err::<Value, _>(HandlerError::new("interrupted"))
            },
        )
        .unwrap()
        .detach();

    adapter
        .send(json!({"seq": 5, "type": "request", "command": "slow"}))
        .await;
    adapter
        .send(json!({
            "seq": 6, "type": "request", "command": "cancel",
            "arguments": {"requestId": 5},
        }))
        .await;

    // Two responses: the cancel ack and the tripped request, in any order.
    let mut by_request_seq = std::collections::HashMap::new();
    for _ in 0..2 {
        let response = adapter.recv().await;
        by_request_seq.insert(response["request_seq"].as_i64().unwrap(), response);
    }
    assert_eq!(by_request_seq[&6]["success"], json!(true));
    assert_eq!(by_request_seq[&5]["success"], json!(false));
    assert_eq!(by_request_seq[&5]["message"], json!("interrupted"));
}

#[tokio::test]
async fn abandoning_a_request_sends_a_cancel_request() {
    let (conn, mut adapter) = connected();

    let token = CancellationToken::new();
    let request = {
        let conn = conn.clone();
        let token = token.clone();
        tokio::spawn(async move { conn.send_request("slow", None, Some(token)).await })
    };

    let seen = adapter.recv().await;
    let seq = seen["seq"].clone();

    token.cancel();
    assert!(matches!(request.await.unwrap(), Err(RpcError::Cancelled)));

    let cancel = adapter.recv().await;
    assert_eq!(cancel["type"], json!("request"));
    assert_eq!(cancel["command"], json!("cancel"));
    assert_eq!(cancel["arguments"]["requestId"], seq);
}

#[tokio::test]
async fn outgoing_seq_is_monotonic_across_message_kinds() {
    let (conn, mut adapter) = connected();
    conn.registry()
        .register("threads", HandlerOptions::parallel(), |(): (), _ctx| async move {
            Ok(json!({"threads": []}))
        })
        .unwrap()
        .detach();

    conn.send_notification("stopped", Some(json!({"reason": "pause"})))
        .await
        .unwrap();
    adapter
        .send(json!({"seq": 1, "type": "request", "command": "threads"}))
        .await;
    conn.send_notification("continued", None).await.unwrap();

    let mut seqs = Vec::new();
    for _ in 0..3 {
        let message = adapter.recv().await;
        seqs.push(message["seq"].as_i64().unwrap());
    }
    // Stamped in write order from one counter: strictly increasing.
    assert!(
        seqs.windows(2).all(|pair| pair[0] < pair[1]),
        "seq not monotonic: {:?}",
        seqs
    );
}

#[tokio::test]
async fn adapter_handshake_completes_via_initialized_event() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (adapter_stream, client_stream) = tokio::io::duplex(64 * 1024);

    let adapter = Connection::new(ConnectionOptions::dap().without_handshake());
    let (read, write) = tokio::io::split(adapter_stream);
    adapter.connect(read, write)?;

    let client = Connection::new(ConnectionOptions::dap());
    let (read, write) = tokio::io::split(client_stream);
    client.connect(read, write)?;

    adapter
        .registry()
        .register(
            "initialize",
            HandlerOptions::serial(),
            |_args: Value, ctx: RequestContext| async move {
                ctx.peer
                    .send_notification("initialized", None)
                    .await
                    .map_err(|err| HandlerError::new(err.to_string()))?;
                Ok(json!({"supportsConfigurationDoneRequest": true}))
            },
        )?
        .detach();
    adapter
        .registry()
        .register("threads", HandlerOptions::parallel(), |(): (), _ctx| async move {
            Ok(json!({"threads": [{"id": 1, "name": "main"}]}))
        })?
        .detach();

    let capabilities = client
        .initialize_dap(json!({"adapterID": "tether-test"}))
        .await?;
    assert_eq!(capabilities["supportsConfigurationDoneRequest"], json!(true));

    let threads = client.send_request("threads", None, None).await?;
    assert_eq!(threads["threads"][0]["name"], json!("main"));
    Ok(())
}
