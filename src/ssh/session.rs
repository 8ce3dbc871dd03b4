use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sprites::reconnect;
use crate::sprites::{CommandSpec, ProcessControl, RemoteProcess, SpriteError, SpriteHandle};

const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Retry floor for interactive shells.
const SHELL_MIN_RETRIES: u32 = 10;

/// Most recent terminal geometry, as reported by pty-req/window-change.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
    pub width_px: u32,
    pub height_px: u32,
}

/// Per-session-channel state, owned by the connection handler.
///
/// Environment and terminal parameters accumulate only until `running`
/// flips; exactly one shell or exec request transitions the session into
/// the running state.
pub struct SessionChannel {
    pub sprite: Arc<dyn SpriteHandle>,
    pub env: Vec<String>,
    pub tty: bool,
    pub running: bool,
    pub window_tx: watch::Sender<WindowSize>,
    pub stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    pub cancel: CancellationToken,
}

impl SessionChannel {
    pub fn new(sprite: Arc<dyn SpriteHandle>, cancel: CancellationToken) -> Self {
        Self {
            sprite,
            env: vec![
                "SHELL=/bin/bash".to_string(),
                "LANG=en_US.UTF-8".to_string(),
                "LC_ALL=en_US.UTF-8".to_string(),
            ],
            tty: false,
            running: false,
            window_tx: watch::channel(WindowSize::default()).0,
            stdin_tx: None,
            cancel,
        }
    }

    /// Record a new window size and wake the sync task. Last write wins.
    pub fn set_window(&mut self, cols: u32, rows: u32, width_px: u32, height_px: u32) {
        self.window_tx.send_replace(WindowSize {
            cols,
            rows,
            width_px,
            height_px,
        });
    }
}

/// Everything needed to run the remote process for one session.
pub struct ExecRequest {
    pub sprite: Arc<dyn SpriteHandle>,
    /// `None` requests a login shell.
    pub command: Option<String>,
    pub tty: bool,
    pub env: Vec<String>,
    pub window: watch::Receiver<WindowSize>,
    pub max_retries: u32,
    pub conn_tag: String,
    pub cancel: CancellationToken,
}

/// The argv run on the sprite for a given request shape.
pub fn build_argv(command: Option<&str>, tty: bool) -> Vec<String> {
    match command {
        // interactive login shell under a pty, plain login shell otherwise
        // (editors pipe commands through stdin without a pty)
        None if tty => vec!["/bin/bash".into(), "-li".into()],
        None => vec!["/bin/bash".into(), "-l".into()],
        Some(cmd) => vec!["/bin/bash".into(), "-c".into(), cmd.to_string()],
    }
}

/// Drive the remote process for a session channel: run it with transient
/// retry, bridge stdio, and report the exit status back on the channel.
///
/// The exit-status reply is only sent for a clean remote exit; cancellation
/// and fatal errors close the channel without one.
pub async fn run(
    request: ExecRequest,
    stdin: mpsc::Receiver<Vec<u8>>,
    handle: Handle,
    channel: ChannelId,
) {
    let is_shell = request.command.is_none();
    let max_retries = if is_shell {
        request.max_retries.max(SHELL_MIN_RETRIES)
    } else {
        request.max_retries
    };

    // The stdin queue outlives individual attempts: a reconnect replaces the
    // transport but keeps the client's byte stream.
    let stdin = Arc::new(Mutex::new(stdin));

    let mut attempt = 0u32;
    let exit_code = loop {
        attempt += 1;
        match run_attempt(&request, stdin.clone(), &handle, channel, attempt).await {
            Ok(code) => break Some(code),
            Err(SpriteError::Cancelled) => {
                info!(conn = %request.conn_tag, %channel, "Session cancelled");
                break None;
            }
            Err(err) if reconnect::is_transient(&err) && attempt < max_retries => {
                if is_shell && request.tty {
                    let banner = format!(
                        "\r\n\x1b[33m[sprite] Connection lost, reconnecting (attempt {}/{})...\x1b[0m\r\n",
                        attempt + 1,
                        max_retries
                    );
                    let _ = handle
                        .data(channel, CryptoVec::from_slice(banner.as_bytes()))
                        .await;
                }
                warn!(
                    conn = %request.conn_tag,
                    attempt = attempt + 1,
                    max_retries,
                    error = %err,
                    "Sprite connection lost, retrying"
                );
                let delay = reconnect::backoff_delay(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = request.cancel.cancelled() => {
                        info!(conn = %request.conn_tag, %channel, "Session cancelled during backoff");
                        break None;
                    }
                }
            }
            Err(err) => {
                error!(conn = %request.conn_tag, error = %err, "Failed to exec on sprite");
                break None;
            }
        }
    };

    if let Some(code) = exit_code {
        let _ = handle.exit_status_request(channel, code).await;
    }
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

async fn run_attempt(
    request: &ExecRequest,
    stdin: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    handle: &Handle,
    channel: ChannelId,
    attempt: u32,
) -> Result<u32, SpriteError> {
    let window = *request.window.borrow();
    let spec = CommandSpec {
        argv: build_argv(request.command.as_deref(), request.tty),
        env: request.env.clone(),
        tty: request.tty,
        // the remote API orders size rows-then-cols, unlike the SSH payload
        tty_size: request
            .tty
            .then_some((window.rows as u16, window.cols as u16)),
    };

    let RemoteProcess {
        stdin: proc_stdin,
        stdout,
        stderr,
        control,
        exit,
    } = request.sprite.spawn(spec).await?;

    if attempt > 1 && request.command.is_none() && request.tty {
        let _ = handle
            .data(
                channel,
                CryptoVec::from_slice(b"\x1b[32m[sprite] Reconnected!\x1b[0m\r\n"),
            )
            .await;
    }
    info!(
        conn = %request.conn_tag,
        tty = request.tty,
        cmd = request.command.as_deref().unwrap_or(""),
        attempt,
        "Started exec session"
    );

    let stdin_task = tokio::spawn(pump_stdin(stdin, proc_stdin));
    let stdout_task = tokio::spawn(pump_output(stdout, handle.clone(), channel, None));
    let stderr_task = tokio::spawn(pump_output(
        stderr,
        handle.clone(),
        channel,
        Some(SSH_EXTENDED_DATA_STDERR),
    ));
    let resize_task = request
        .tty
        .then(|| tokio::spawn(sync_window(request.window.clone(), control)));

    let result = tokio::select! {
        status = exit => status,
        _ = request.cancel.cancelled() => Err(SpriteError::Cancelled),
    };

    stdin_task.abort();
    if let Some(task) = resize_task {
        task.abort();
    }
    if result.is_ok() {
        // drain whatever output the transport still holds
        let _ = stdout_task.await;
        let _ = stderr_task.await;
    } else {
        stdout_task.abort();
        stderr_task.abort();
    }
    result
}

async fn pump_stdin(
    stdin: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    mut dst: Box<dyn AsyncWrite + Send + Unpin>,
) {
    let mut stdin = stdin.lock().await;
    while let Some(chunk) = stdin.recv().await {
        if dst.write_all(&chunk).await.is_err() {
            return;
        }
    }
    // sender dropped: the client sent EOF
    let _ = dst.shutdown().await;
}

async fn pump_output(
    mut src: Box<dyn AsyncRead + Send + Unpin>,
    handle: Handle,
    channel: ChannelId,
    ext: Option<u32>,
) {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = CryptoVec::from_slice(&buf[..n]);
                let write = match ext {
                    Some(code) => handle.extended_data(channel, code, data).await,
                    None => handle.data(channel, data).await,
                };
                if write.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "remote output read error");
                break;
            }
        }
    }
}

/// Forward each window change to the remote terminal. Wakes on every
/// update and applies the most recent geometry, rows first.
async fn sync_window(mut window: watch::Receiver<WindowSize>, control: Arc<dyn ProcessControl>) {
    while window.changed().await.is_ok() {
        let win = *window.borrow_and_update();
        if control
            .set_tty_size(win.rows as u16, win.cols as u16)
            .await
            .is_err()
        {
            break;
        }
    }
}
