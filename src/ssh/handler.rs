use dashmap::DashMap;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::types::AppConfig;
use crate::sprites::credentials::ApiCredentials;
use crate::sprites::{SpriteDirectory, SpriteHandle};
use crate::ssh::forward::{self, DirectTcpipParams};
use crate::ssh::session::{self, ExecRequest, SessionChannel};
use crate::utils;

/// Sprite lookup deadline inside the auth callback.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state handed to every connection handler.
pub struct ServerContext {
    pub config: Arc<AppConfig>,
    pub directory: Arc<dyn SpriteDirectory>,
    pub credentials: ApiCredentials,
    pub pending_auth: PendingAuth,
}

/// Short-lived map from `(username, client address)` to the sprite resolved
/// during the public-key callback. Entries are taken exactly once when the
/// connection opens its first channel; anything left over is evicted when
/// the connection goes away.
#[derive(Default)]
pub struct PendingAuth {
    entries: DashMap<(String, SocketAddr), Arc<dyn SpriteHandle>>,
}

impl PendingAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: &str, peer: SocketAddr, sprite: Arc<dyn SpriteHandle>) {
        self.entries.insert((user.to_string(), peer), sprite);
    }

    /// Load-and-delete: a second take for the same key yields nothing.
    pub fn take(&self, user: &str, peer: SocketAddr) -> Option<Arc<dyn SpriteHandle>> {
        self.entries
            .remove(&(user.to_string(), peer))
            .map(|(_, sprite)| sprite)
    }

    pub fn evict(&self, user: &str, peer: SocketAddr) {
        self.entries.remove(&(user.to_string(), peer));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-connection SSH handler: authenticates the user against the sprite
/// directory, then dispatches session and direct-tcpip channels.
pub struct SshHandler {
    ctx: Arc<ServerContext>,
    peer_addr: SocketAddr,
    conn_tag: String,
    cancel: CancellationToken,
    username: Option<String>,
    sprite: Option<Arc<dyn SpriteHandle>>,
    sessions: HashMap<ChannelId, SessionChannel>,
}

impl SshHandler {
    pub fn new(ctx: Arc<ServerContext>, peer_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            peer_addr,
            conn_tag: utils::connection_tag(),
            cancel,
            username: None,
            sprite: None,
            sessions: HashMap::new(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.conn_tag
    }

    /// The sprite bound to this connection, consuming the pending-auth entry
    /// on first use.
    fn attached_sprite(&mut self) -> Option<Arc<dyn SpriteHandle>> {
        if self.sprite.is_none() {
            let username = self.username.clone()?;
            self.sprite = self.ctx.pending_auth.take(&username, self.peer_addr);
        }
        self.sprite.clone()
    }

    fn start_exec(
        &mut self,
        channel: ChannelId,
        command: Option<String>,
        session: &mut Session,
    ) -> Result<(), anyhow::Error> {
        let Some(state) = self.sessions.get_mut(&channel) else {
            let _ = session.channel_failure(channel);
            return Ok(());
        };
        if state.running {
            debug!(conn = %self.conn_tag, %channel, "exec already running");
            let _ = session.channel_failure(channel);
            return Ok(());
        }
        state.running = true;

        let (stdin_tx, stdin_rx) = mpsc::channel(64);
        state.stdin_tx = Some(stdin_tx);

        let request = ExecRequest {
            sprite: state.sprite.clone(),
            command,
            tty: state.tty,
            env: state.env.clone(),
            window: state.window_tx.subscribe(),
            max_retries: self.ctx.config.server.max_retries,
            conn_tag: self.conn_tag.clone(),
            cancel: state.cancel.clone(),
        };

        let _ = session.channel_success(channel);
        tokio::spawn(session::run(request, stdin_rx, session.handle(), channel));
        Ok(())
    }
}

impl Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Any well-formed key may proceed to the signature check.
        Ok(Auth::Accept)
    }

    /// The auth point. The offered key is not checked against anything: the
    /// security perimeter is the provider credential this process holds. The
    /// username selects the sprite, and an unresolvable name fails the
    /// handshake.
    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let lookup = self.ctx.directory.lookup(user);
        match tokio::time::timeout(LOOKUP_TIMEOUT, lookup).await {
            Ok(Ok(sprite)) => {
                self.ctx.pending_auth.insert(user, self.peer_addr, sprite);
                self.username = Some(user.to_string());
                info!(
                    conn = %self.conn_tag,
                    user = %user,
                    ip = %self.peer_addr,
                    "Public key auth success"
                );
                Ok(Auth::Accept)
            }
            Ok(Err(e)) => {
                error!(conn = %self.conn_tag, user = %user, error = %e, "Sprite not found");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
            Err(_) => {
                error!(conn = %self.conn_tag, user = %user, "Sprite lookup timed out");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(sprite) = self.attached_sprite() else {
            error!(conn = %self.conn_tag, user = ?self.username, "Sprite not found after auth");
            return Ok(false);
        };

        info!(
            conn = %self.conn_tag,
            channel = %channel.id(),
            sprite = %sprite.name(),
            "Opening session channel"
        );
        self.sessions.insert(
            channel.id(),
            SessionChannel::new(sprite, self.cancel.child_token()),
        );
        // Channel IO rides the handler callbacks; the object is not needed.
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(sprite) = self.attached_sprite() else {
            error!(conn = %self.conn_tag, user = ?self.username, "Sprite not found after auth");
            return Ok(false);
        };

        let params = DirectTcpipParams {
            dest_host: host_to_connect.to_string(),
            dest_port: port_to_connect,
            origin_host: originator_address.to_string(),
            origin_port: originator_port,
        };
        debug!(
            conn = %self.conn_tag,
            dest = %format!("{}:{}", params.dest_host, params.dest_port),
            origin = %format!("{}:{}", params.origin_host, params.origin_port),
            "direct-tcpip channel open"
        );

        tokio::spawn(forward::run(
            channel,
            session.handle(),
            params,
            self.ctx.credentials.clone(),
            sprite.name().to_string(),
            self.cancel.child_token(),
        ));
        Ok(true)
    }

    /// Reject X11 channels and any other channel type russh surfaces.
    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(conn = %self.conn_tag, "X11 channel denied");
        Ok(false)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let accepted = match self.sessions.get_mut(&channel) {
            Some(state) if !state.running => {
                state.env.push(format!("{variable_name}={variable_value}"));
                true
            }
            _ => false,
        };
        if accepted {
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let accepted = match self.sessions.get_mut(&channel) {
            // one pty per session, and only before the process starts
            Some(state) if !state.running && !state.tty => {
                state.env.push(format!("TERM={term}"));
                state.env.push("COLORTERM=truecolor".to_string());
                state.tty = true;
                state.set_window(col_width, row_height, pix_width, pix_height);
                true
            }
            _ => false,
        };
        if accepted {
            let _ = session.channel_success(channel);
        } else {
            debug!(conn = %self.conn_tag, %channel, "pty request rejected");
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.sessions.get_mut(&channel) {
            state.set_window(col_width, row_height, pix_width, pix_height);
            // clients do not normally ask for a reply here; russh only sends
            // one when they did
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_exec(channel, None, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        // an empty exec command behaves like a shell request
        let command = (!command.is_empty()).then_some(command);
        self.start_exec(channel, command, session)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.sessions.get(&channel) {
            if let Some(tx) = &state.stdin_tx {
                let _ = tx.send(data.to_vec()).await;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // dropping the sender signals stdin EOF to the remote process
        if let Some(state) = self.sessions.get_mut(&channel) {
            state.stdin_tx = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.sessions.remove(&channel) {
            state.cancel.cancel();
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(conn = %self.conn_tag, subsystem = %name, "Subsystem denied");
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(conn = %self.conn_tag, %channel, ?signal, "signal unsupported");
        let _ = session.channel_failure(channel);
        Ok(())
    }

    /// Reverse port forwarding is not supported.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(conn = %self.conn_tag, %address, %port, "Reverse forwarding denied");
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        // evict the pending entry if no channel ever consumed it
        if self.sprite.is_none() {
            if let Some(username) = &self.username {
                self.ctx.pending_auth.evict(username, self.peer_addr);
            }
        }
        for state in self.sessions.values() {
            state.cancel.cancel();
        }
        self.cancel.cancel();
        debug!(conn = %self.conn_tag, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sprites::{CommandSpec, RemoteProcess, SpriteError};
    use async_trait::async_trait;

    struct NullSprite;

    #[async_trait]
    impl SpriteHandle for NullSprite {
        fn name(&self) -> &str {
            "null"
        }

        async fn spawn(&self, _spec: CommandSpec) -> Result<RemoteProcess, SpriteError> {
            Err(SpriteError::Api("not runnable".into()))
        }
    }

    #[test]
    fn test_pending_auth_take_is_load_and_delete() {
        let pending = PendingAuth::new();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        pending.insert("box", peer, Arc::new(NullSprite));

        assert_eq!(pending.len(), 1);
        assert!(pending.take("box", peer).is_some());
        assert!(pending.take("box", peer).is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_pending_auth_keyed_by_user_and_peer() {
        let pending = PendingAuth::new();
        let peer_a: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let peer_b: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        pending.insert("box", peer_a, Arc::new(NullSprite));

        assert!(pending.take("box", peer_b).is_none());
        assert!(pending.take("other", peer_a).is_none());
        assert!(pending.take("box", peer_a).is_some());
    }

    #[test]
    fn test_pending_auth_evict() {
        let pending = PendingAuth::new();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        pending.insert("box", peer, Arc::new(NullSprite));
        pending.evict("box", peer);
        assert!(pending.is_empty());
    }
}
