use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use russh::server::{Handle, Msg};
use russh::Channel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::sprites::api::USER_AGENT;
use crate::sprites::credentials::ApiCredentials;

/// Ping period on the proxy WebSocket.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Receive deadline: keepalive period plus the reply grace window. Any
/// inbound frame (pong included) refreshes it.
const READ_DEADLINE: Duration = Duration::from_secs(45);

/// Message and frame ceiling on the proxy WebSocket.
const WS_BUFFER_SIZE: usize = 1024 * 1024;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Parsed extra data of a direct-tcpip channel open.
#[derive(Debug, Clone)]
pub struct DirectTcpipParams {
    pub dest_host: String,
    pub dest_port: u32,
    pub origin_host: String,
    pub origin_port: u32,
}

#[derive(Serialize)]
struct ProxyInit<'a> {
    host: &'a str,
    port: u32,
}

#[derive(Deserialize)]
struct ProxyResponse {
    status: String,
    #[serde(default)]
    target: String,
}

/// Proxy endpoint URL: the API base with the scheme switched http(s)→ws(s)
/// and the path replaced.
pub fn build_proxy_url(api_url: &str, sprite: &str) -> Result<Url> {
    let mut url = Url::parse(api_url).context("invalid API base URL")?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => anyhow::bail!("unsupported API scheme: {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot switch URL scheme"))?;
    url.set_path(&format!("/v1/sprites/{sprite}/proxy"));
    Ok(url)
}

/// The init frame sent before any data. An empty destination means the
/// sprite's own loopback.
fn init_frame(dest_host: &str, dest_port: u32) -> Result<String> {
    let host = if dest_host.is_empty() {
        "localhost"
    } else {
        dest_host
    };
    serde_json::to_string(&ProxyInit {
        host,
        port: dest_port,
    })
    .context("encoding proxy init frame")
}

/// Serve one direct-tcpip channel until either side closes.
pub async fn run(
    channel: Channel<Msg>,
    handle: Handle,
    params: DirectTcpipParams,
    credentials: ApiCredentials,
    sprite_name: String,
    cancel: CancellationToken,
) {
    let channel_id = channel.id();
    let dest = format!("{}:{}", params.dest_host, params.dest_port);
    if let Err(err) = bridge(channel, &params, &credentials, &sprite_name, &cancel).await {
        debug!(dest = %dest, error = %err, "direct-tcpip forward failed");
    }
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
    debug!(dest = %dest, "direct-tcpip forward completed");
}

async fn bridge(
    channel: Channel<Msg>,
    params: &DirectTcpipParams,
    credentials: &ApiCredentials,
    sprite_name: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let dest = format!("{}:{}", params.dest_host, params.dest_port);
    info!(dest = %dest, sprite = %sprite_name, "Starting direct-tcpip forward via WebSocket proxy");

    let url = build_proxy_url(&credentials.api_url, sprite_name)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .context("building proxy request")?;
    let auth = HeaderValue::from_str(&format!("Bearer {}", credentials.token))
        .context("token is not a valid header value")?;
    request.headers_mut().insert(header::AUTHORIZATION, auth);
    request
        .headers_mut()
        .insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));

    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(WS_BUFFER_SIZE))
        .max_frame_size(Some(WS_BUFFER_SIZE))
        .write_buffer_size(0);
    let (ws, _) = connect_async_with_config(request, Some(ws_config), false)
        .await
        .context("connecting to proxy websocket")?;
    let (sink, mut stream) = ws.split();
    let sink = Arc::new(Mutex::new(sink));

    sink.lock()
        .await
        .send(Message::Text(
            init_frame(&params.dest_host, params.dest_port)?.into(),
        ))
        .await
        .context("sending proxy init frame")?;

    let response: ProxyResponse = loop {
        match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                break serde_json::from_str(text.as_str()).context("parsing proxy response")?;
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                anyhow::bail!("proxy closed before responding");
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => return Err(e).context("reading proxy response"),
            Err(_) => anyhow::bail!("timed out waiting for proxy response"),
        }
    };
    if response.status != "connected" {
        anyhow::bail!("proxy connection failed: status {}", response.status);
    }
    info!(dest = %dest, target = %response.target, "Proxy connection established");

    let (mut read_half, write_half) = channel.split();
    let mut channel_reader = read_half.make_reader();
    let mut channel_writer = write_half.make_writer();

    // Three legs; the bridge ends when the first one does. An SSH-side EOF
    // closes the WebSocket, a WebSocket close ends the channel.
    let uplink = {
        let sink = sink.clone();
        async move {
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            loop {
                match channel_reader.read(&mut buf).await {
                    Ok(0) => {
                        let _ = sink.lock().await.send(Message::Close(None)).await;
                        break;
                    }
                    Ok(n) => {
                        if sink
                            .lock()
                            .await
                            .send(Message::Binary(buf[..n].to_vec().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "SSH channel read error");
                        break;
                    }
                }
            }
        }
    };

    let downlink = async {
        loop {
            match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
                Ok(Some(Ok(Message::Binary(data)))) => {
                    if channel_writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                // pongs and stray text frames only refresh the deadline
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(err))) => {
                    debug!(error = %err, "WebSocket read error");
                    break;
                }
                Err(_) => {
                    debug!("proxy read deadline expired");
                    break;
                }
            }
        }
    };

    let ping = {
        let sink = sink.clone();
        async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sink
                    .lock()
                    .await
                    .send(Message::Ping(Vec::new().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = uplink => {}
        _ = downlink => {}
        _ = ping => {}
        _ = cancel.cancelled() => {}
    }

    let _ = sink.lock().await.close().await;
    Ok(())
}
