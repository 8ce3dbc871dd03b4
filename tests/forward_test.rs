mod common;

use common::*;
use futures_util::{SinkExt, StreamExt};
use russh::ChannelMsg;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// In-process stand-in for the provider proxy endpoint: records the init
/// frame, the Authorization header and uplink frame sizes, and pushes one
/// 4-byte downlink frame once both uplink writes arrived.
struct FakeProxy {
    port: u16,
    init_frames: Arc<Mutex<Vec<String>>>,
    frame_sizes: Arc<Mutex<Vec<usize>>>,
    auth_headers: Arc<Mutex<Vec<String>>>,
}

async fn start_fake_proxy(status: &'static str) -> FakeProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let init_frames: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let frame_sizes: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let auth_headers: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let init_frames = init_frames.clone();
        let frame_sizes = frame_sizes.clone();
        let auth_headers = auth_headers.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let init_frames = init_frames.clone();
                let frame_sizes = frame_sizes.clone();
                let auth_headers = auth_headers.clone();
                tokio::spawn(async move {
                    let callback = {
                        let auth_headers = auth_headers.clone();
                        move |req: &Request, resp: Response| {
                            if let Some(value) = req.headers().get("authorization") {
                                auth_headers
                                    .lock()
                                    .unwrap()
                                    .push(value.to_str().unwrap_or_default().to_string());
                            }
                            Ok(resp)
                        }
                    };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                    else {
                        return;
                    };

                    match ws.next().await {
                        Some(Ok(Message::Text(init))) => {
                            init_frames.lock().unwrap().push(init.to_string());
                        }
                        _ => return,
                    }

                    let reply = format!(r#"{{"status":"{status}","target":"10.0.0.1:5432"}}"#);
                    if ws.send(Message::Text(reply.into())).await.is_err() {
                        return;
                    }
                    if status != "connected" {
                        let _ = ws.close(None).await;
                        return;
                    }

                    let mut uplink_count = 0usize;
                    while let Some(Ok(msg)) = ws.next().await {
                        match msg {
                            Message::Binary(data) => {
                                frame_sizes.lock().unwrap().push(data.len());
                                uplink_count += 1;
                                if uplink_count == 2 {
                                    let _ = ws
                                        .send(Message::Binary(vec![0xde, 0xad, 0xbe, 0xef].into()))
                                        .await;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                });
            }
        });
    }

    FakeProxy {
        port,
        init_frames,
        frame_sizes,
        auth_headers,
    }
}

// ---------------------------------------------------------------------------
// Happy path: init normalization, per-read framing, downlink delivery
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_direct_tcpip_bridge() {
    let proxy = start_fake_proxy("connected").await;
    let sprite = StubSprite::new("dev-box");
    let server = start_server_with_api(
        StubDirectory::with(vec![sprite]),
        &format!("http://127.0.0.1:{}", proxy.port),
    )
    .await;

    let handle = connect(server.port, "dev-box").await;
    let mut channel = handle
        .channel_open_direct_tcpip("", 5432, "127.0.0.1", 39000)
        .await
        .expect("direct-tcpip open should succeed");

    channel.data(&[0x11u8; 10][..]).await.unwrap();
    // pace the writes so each arrives as its own channel read
    tokio::time::sleep(Duration::from_millis(200)).await;
    channel.data(&[0x22u8; 17][..]).await.unwrap();

    // downlink: one 4-byte binary frame becomes one 4-byte channel write
    let mut downlink = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    while downlink.len() < 4 {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => downlink.extend_from_slice(&data),
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => panic!("timed out waiting for downlink data"),
        }
    }
    assert_eq!(downlink, vec![0xde, 0xad, 0xbe, 0xef]);

    // init frame had the empty destination normalized to localhost
    let init_frames = proxy.init_frames.lock().unwrap().clone();
    assert_eq!(init_frames.len(), 1);
    let init: serde_json::Value = serde_json::from_str(&init_frames[0]).unwrap();
    assert_eq!(init["host"], "localhost");
    assert_eq!(init["port"], 5432);

    // one binary frame per uplink read, sizes preserved
    let sizes = proxy.frame_sizes.lock().unwrap().clone();
    assert_eq!(sizes, vec![10, 17]);

    // the proxy saw the bearer token
    let auth = proxy.auth_headers.lock().unwrap().clone();
    assert_eq!(auth, vec!["Bearer test-token".to_string()]);
}

// ---------------------------------------------------------------------------
// A non-connected proxy status closes the channel without any data
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_direct_tcpip_rejected_by_proxy() {
    let proxy = start_fake_proxy("error").await;
    let sprite = StubSprite::new("dev-box");
    let server = start_server_with_api(
        StubDirectory::with(vec![sprite]),
        &format!("http://127.0.0.1:{}", proxy.port),
    )
    .await;

    let handle = connect(server.port, "dev-box").await;
    let mut channel = handle
        .channel_open_direct_tcpip("db.internal", 5432, "127.0.0.1", 39000)
        .await
        .expect("channel opens before the proxy handshake runs");

    let mut got_data = false;
    loop {
        match timeout(WAIT, channel.wait()).await.expect("timed out") {
            Some(ChannelMsg::Data { .. }) => got_data = true,
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    assert!(!got_data, "no data expected when the proxy refuses");

    // destination passed through verbatim for non-empty hosts
    let init_frames = proxy.init_frames.lock().unwrap().clone();
    let init: serde_json::Value = serde_json::from_str(&init_frames[0]).unwrap();
    assert_eq!(init["host"], "db.internal");
}
