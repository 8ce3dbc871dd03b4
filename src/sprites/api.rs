use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use crate::sprites::credentials::ApiCredentials;
use crate::sprites::{
    CommandSpec, ProcessControl, RemoteProcess, SpriteDirectory, SpriteError, SpriteHandle,
};

pub const USER_AGENT: &str = concat!("spritessh/", env!("CARGO_PKG_VERSION"));

/// Message and frame ceiling on provider WebSockets.
const WS_BUFFER_SIZE: usize = 1024 * 1024;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Stream tags on exec binary frames. The first payload byte selects the
/// stream, the rest is data.
const STREAM_STDIN: u8 = 0;
const STREAM_STDOUT: u8 = 1;
const STREAM_STDERR: u8 = 2;

/// Production sprite directory backed by the provider HTTP API.
pub struct SpritesApiClient {
    http: reqwest::Client,
    credentials: ApiCredentials,
}

impl SpritesApiClient {
    pub fn new(credentials: ApiCredentials) -> Result<Self, SpriteError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .map_err(|e| SpriteError::Api(e.to_string()))?;
        Ok(Self { http, credentials })
    }
}

#[async_trait]
impl SpriteDirectory for SpritesApiClient {
    async fn lookup(&self, name: &str) -> Result<Arc<dyn SpriteHandle>, SpriteError> {
        let url = format!("{}/v1/sprites/{}", self.credentials.api_url, name);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.credentials.token)
            .send()
            .await
            .map_err(|e| SpriteError::Api(format!("sprite lookup: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SpriteError::NotFound(name.to_string()));
        }
        if !response.status().is_success() {
            return Err(SpriteError::Api(format!(
                "sprite lookup for {name}: HTTP {}",
                response.status()
            )));
        }

        Ok(Arc::new(ApiSprite {
            name: name.to_string(),
            credentials: self.credentials.clone(),
        }))
    }
}

/// A sprite resolved through the API. Commands run over the provider's exec
/// WebSocket: one JSON start frame, one JSON status reply, then tagged
/// binary stdio frames plus JSON resize/exit control frames.
struct ApiSprite {
    name: String,
    credentials: ApiCredentials,
}

#[derive(Serialize)]
struct ExecStart<'a> {
    command: &'a [String],
    env: &'a [String],
    tty: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cols: Option<u16>,
}

#[derive(Deserialize)]
struct ExecStatus {
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct ExecResize {
    resize: ResizeBody,
}

#[derive(Serialize)]
struct ResizeBody {
    rows: u16,
    cols: u16,
}

#[derive(Deserialize)]
struct ExecExit {
    exit_code: u32,
}

#[async_trait]
impl SpriteHandle for ApiSprite {
    fn name(&self) -> &str {
        &self.name
    }

    async fn spawn(&self, spec: CommandSpec) -> Result<RemoteProcess, SpriteError> {
        let url = exec_url(&self.credentials.api_url, &self.name)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(SpriteError::WebSocket)?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.credentials.token))
            .map_err(|_| SpriteError::Api("token is not a valid header value".into()))?;
        request.headers_mut().insert(header::AUTHORIZATION, auth);
        request.headers_mut().insert(
            header::USER_AGENT,
            HeaderValue::from_static(USER_AGENT),
        );

        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(WS_BUFFER_SIZE))
            .max_frame_size(Some(WS_BUFFER_SIZE))
            .write_buffer_size(0);
        let (ws, _) = connect_async_with_config(request, Some(ws_config), false).await?;
        let (mut sink, mut stream) = ws.split();

        let (rows, cols) = match spec.tty_size {
            Some((r, c)) => (Some(r), Some(c)),
            None => (None, None),
        };
        let start = ExecStart {
            command: &spec.argv,
            env: &spec.env,
            tty: spec.tty,
            rows,
            cols,
        };
        let start_frame =
            serde_json::to_string(&start).map_err(|e| SpriteError::Api(e.to_string()))?;
        sink.send(Message::Text(start_frame.into())).await?;

        let status: ExecStatus = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    break serde_json::from_str(text.as_str())
                        .map_err(|e| SpriteError::Api(format!("bad exec status frame: {e}")))?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(SpriteError::Api(
                        "websocket: close before exec start reply".into(),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };
        if status.status != "started" {
            return Err(SpriteError::Api(format!(
                "exec rejected ({}): {}",
                status.status, status.message
            )));
        }

        // Stdio pipes between the session bridge and the socket tasks.
        let (stdin_local, mut stdin_remote) = tokio::io::duplex(WS_BUFFER_SIZE);
        let (mut stdout_remote, stdout_local) = tokio::io::duplex(WS_BUFFER_SIZE);
        let (mut stderr_remote, stderr_local) = tokio::io::duplex(WS_BUFFER_SIZE);
        let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<ExecResize>(8);
        let (exit_tx, exit_rx) = oneshot::channel::<Result<u32, SpriteError>>();

        // Writer: stdin frames, resize frames, keepalive pings.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 32 * 1024];
            let mut stdin_open = true;
            let mut ping = tokio::time::interval(Duration::from_secs(30));
            ping.tick().await;
            loop {
                tokio::select! {
                    read = stdin_remote.read(&mut buf), if stdin_open => match read {
                        Ok(0) | Err(_) => {
                            stdin_open = false;
                            // empty stdin frame marks EOF
                            if sink.send(Message::Binary(vec![STREAM_STDIN].into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(n) => {
                            let mut frame = Vec::with_capacity(n + 1);
                            frame.push(STREAM_STDIN);
                            frame.extend_from_slice(&buf[..n]);
                            if sink.send(Message::Binary(frame.into())).await.is_err() {
                                break;
                            }
                        }
                    },
                    ctrl = ctrl_rx.recv() => match ctrl {
                        Some(resize) => {
                            let Ok(frame) = serde_json::to_string(&resize) else { continue };
                            if sink.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        // all control senders gone: the process was dropped
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    _ = ping.tick() => {
                        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader: stdio frames out, exit frame resolves the wait future.
        tokio::spawn(async move {
            let mut exit_tx = Some(exit_tx);
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Binary(data)) if !data.is_empty() => {
                        let (tag, payload) = (data[0], &data[1..]);
                        let result = match tag {
                            STREAM_STDOUT => stdout_remote.write_all(payload).await,
                            STREAM_STDERR => stderr_remote.write_all(payload).await,
                            _ => Ok(()),
                        };
                        if result.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Text(text)) => {
                        if let Ok(exit) = serde_json::from_str::<ExecExit>(text.as_str()) {
                            if let Some(tx) = exit_tx.take() {
                                let _ = tx.send(Ok(exit.exit_code));
                            }
                            break;
                        }
                        debug!(frame = %text, "ignoring unknown exec control frame");
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(tx) = exit_tx.take() {
                            let _ = tx.send(Err(e.into()));
                        }
                        break;
                    }
                }
            }
            if let Some(tx) = exit_tx.take() {
                let _ = tx.send(Err(SpriteError::Api(
                    "websocket: close before exit status".into(),
                )));
            }
        });

        let exit = Box::pin(async move {
            match exit_rx.await {
                Ok(result) => result,
                Err(_) => Err(SpriteError::Api("websocket: close before exit status".into())),
            }
        });

        Ok(RemoteProcess {
            stdin: Box::new(stdin_local),
            stdout: Box::new(stdout_local),
            stderr: Box::new(stderr_local),
            control: Arc::new(ApiProcessControl { tx: ctrl_tx }),
            exit,
        })
    }
}

struct ApiProcessControl {
    tx: mpsc::Sender<ExecResize>,
}

#[async_trait]
impl ProcessControl for ApiProcessControl {
    async fn set_tty_size(&self, rows: u16, cols: u16) -> Result<(), SpriteError> {
        self.tx
            .send(ExecResize {
                resize: ResizeBody { rows, cols },
            })
            .await
            .map_err(|_| SpriteError::Api("exec control channel closed".into()))
    }
}

/// Exec endpoint URL: the API base with the scheme switched to ws(s).
fn exec_url(api_url: &str, sprite: &str) -> Result<Url, SpriteError> {
    let mut url = Url::parse(api_url).map_err(|e| SpriteError::Api(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(SpriteError::Api(format!("unsupported API scheme: {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| SpriteError::Api("cannot switch URL scheme".into()))?;
    url.set_path(&format!("/v1/sprites/{sprite}/exec"));
    Ok(url)
}
