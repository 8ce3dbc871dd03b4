pub mod api;
pub mod credentials;
pub mod reconnect;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors from the provider layer and remote process transport.
#[derive(thiserror::Error, Debug)]
pub enum SpriteError {
    #[error("sprite not found: {0}")]
    NotFound(String),

    #[error("provider api error: {0}")]
    Api(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("operation cancelled")]
    Cancelled,
}

/// What to run on a sprite. `env` entries are `NAME=VALUE`.
/// `tty_size` is ordered rows-then-cols.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub tty: bool,
    pub tty_size: Option<(u16, u16)>,
}

/// Resolves sprite names to handles through the provider API.
#[async_trait]
pub trait SpriteDirectory: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Arc<dyn SpriteHandle>, SpriteError>;
}

/// A resolved sprite. Handles are shared by a connection and all of its
/// channels and must outlive them.
#[async_trait]
pub trait SpriteHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn spawn(&self, spec: CommandSpec) -> Result<RemoteProcess, SpriteError>;
}

/// Runtime control surface of a started process.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Resize the remote terminal. Argument order is rows, cols.
    async fn set_tty_size(&self, rows: u16, cols: u16) -> Result<(), SpriteError>;
}

/// A process started on a sprite, with standard stdio wiring.
///
/// `exit` resolves with the remote exit code on a clean exit (any code,
/// including non-zero) and with an error on transport failure. Dropping the
/// process tears the transport down and kills the remote command.
pub struct RemoteProcess {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Arc<dyn ProcessControl>,
    pub exit: BoxFuture<'static, Result<u32, SpriteError>>,
}

impl std::fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RemoteProcess")
    }
}
