use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use russh::{MethodKind, MethodSet, SshId};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::types::AppConfig;
use crate::sprites::api::SpritesApiClient;
use crate::sprites::credentials::ApiCredentials;
use crate::sprites::SpriteDirectory;
use crate::ssh::handler::{PendingAuth, ServerContext, SshHandler};
use crate::ssh::keys;

/// The SSH front-end: accept loop, connection tracking, graceful shutdown.
pub struct Server {
    context: Arc<ServerContext>,
    host_key: PrivateKey,
    closed: AtomicBool,
    cancel: CancellationToken,
    connections: TaskTracker,
    listeners: Mutex<HashSet<SocketAddr>>,
}

impl Server {
    pub fn new(
        config: Arc<AppConfig>,
        directory: Arc<dyn SpriteDirectory>,
        credentials: ApiCredentials,
        host_key: PrivateKey,
    ) -> Self {
        Self {
            context: Arc::new(ServerContext {
                config,
                directory,
                credentials,
                pending_auth: PendingAuth::new(),
            }),
            host_key,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            connections: TaskTracker::new(),
            listeners: Mutex::new(HashSet::new()),
        }
    }

    /// Shared per-connection state; exposed for the test harness.
    pub fn context(&self) -> Arc<ServerContext> {
        self.context.clone()
    }

    /// Bind the TCP listener, bounded by the socket timeout.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = &self.context.config.server.listen;
        let timeout = Duration::from_secs(self.context.config.server.socket_timeout_secs);
        let listener = tokio::time::timeout(timeout, TcpListener::bind(addr))
            .await
            .with_context(|| format!("timed out binding {addr}"))?
            .with_context(|| format!("binding {addr}"))?;
        Ok(listener)
    }

    /// Accept connections until shutdown. One task per connection, tracked
    /// for draining.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("server closed");
        }
        let local_addr = listener.local_addr()?;
        self.track_listener(local_addr, true);
        info!(addr = %local_addr, "SSH server listening");

        let russh_config = Arc::new(self.russh_config());

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = SshHandler::new(
                            self.context.clone(),
                            peer,
                            self.cancel.child_token(),
                        );
                        info!(peer = %peer, conn = %handler.tag(), "New SSH connection");
                        let config = russh_config.clone();
                        self.connections.spawn(async move {
                            match russh::server::run_stream(config, stream, handler).await {
                                Ok(session) => {
                                    if let Err(err) = session.await {
                                        debug!(error = %err, "SSH session ended with error");
                                    }
                                }
                                Err(err) => {
                                    debug!(error = %err, "SSH handshake failed");
                                }
                            }
                        });
                    }
                    Err(err) => break Err(err).context("accepting connection"),
                },
            }
        };

        self.track_listener(local_addr, false);
        result
    }

    /// Graceful shutdown: idempotent. The first call cancels the root scope,
    /// closes the listeners and waits for in-flight connections to drain;
    /// later calls fail with a "server closed" error.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            anyhow::bail!("server closed");
        }
        info!("Initiating graceful shutdown");
        self.cancel.cancel();
        self.connections.close();
        tokio::time::timeout(deadline, self.connections.wait())
            .await
            .context("shutdown deadline expired while draining connections")?;
        info!("Graceful shutdown complete");
        Ok(())
    }

    fn track_listener(&self, addr: SocketAddr, add: bool) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if add {
            listeners.insert(addr);
        } else {
            listeners.remove(&addr);
        }
    }

    fn russh_config(&self) -> russh::server::Config {
        let server = &self.context.config.server;
        let mut config = russh::server::Config::default();
        config.keys.push(self.host_key.clone());
        config.server_id = SshId::Standard(format!("SSH-2.0-spritessh_{}", crate::VERSION));
        config.auth_rejection_time = Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(Duration::from_secs(0));
        config.methods = MethodSet::from([MethodKind::PublicKey].as_slice());

        // Server-side keepalive: russh sends keepalive@openssh.com global
        // requests and closes the connection when replies stop coming.
        if server.keepalive_interval_secs > 0 {
            config.keepalive_interval = Some(Duration::from_secs(server.keepalive_interval_secs));
            config.keepalive_max = server.keepalive_max as usize;
        }
        config
    }
}

/// Resolve credentials, load the host key, and run the server until a
/// shutdown signal arrives. Configuration problems surface here, before
/// the listener is bound.
pub async fn run(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);

    let credentials = ApiCredentials::resolve(&config.sprites)?;

    let key_path = if config.server.host_key_path.as_os_str().is_empty() {
        keys::default_host_key_path()?
    } else {
        config.server.host_key_path.clone()
    };
    let host_key = keys::load_or_generate_host_key(&key_path)?;
    info!(path = %key_path.display(), "Host key loaded");

    let directory = Arc::new(SpritesApiClient::new(credentials.clone())?);
    let server = Arc::new(Server::new(config.clone(), directory, credentials, host_key));

    let listener = server.bind().await?;
    let serve_task = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(err) = server.serve(listener).await {
                error!(error = %err, "SSH server error");
            }
        })
    };

    wait_for_shutdown_signal().await?;
    info!("Shutdown signal received");

    let deadline = Duration::from_secs(config.server.socket_timeout_secs);
    server.shutdown(deadline).await?;
    let _ = serve_task.await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")
}
