#![allow(dead_code)]

use async_trait::async_trait;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::keys::PrivateKey;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use spritessh::config::types::AppConfig;
use spritessh::server::Server;
use spritessh::sprites::credentials::ApiCredentials;
use spritessh::sprites::{
    CommandSpec, ProcessControl, RemoteProcess, SpriteDirectory, SpriteError, SpriteHandle,
};

/// Get an OS-assigned free port
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Minimal russh client handler for testing
pub struct TestClientHandler;

impl russh::client::Handler for TestClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true) // Accept any server key for testing
    }
}

/// Scripted behavior for the next spawn on a stub sprite.
pub enum SpawnOutcome {
    /// spawn() itself fails with this error text
    Fail(String),
    /// process writes its output, then exits with the code
    Exit {
        code: u32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    /// process runs until client stdin reaches EOF, then exits 0
    RunUntilStdinEof,
}

/// In-memory sprite: remote processes are duplex pipes, resize calls are
/// recorded for assertions.
pub struct StubSprite {
    name: String,
    outcomes: Mutex<VecDeque<SpawnOutcome>>,
    spawns: Mutex<Vec<CommandSpec>>,
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl StubSprite {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            outcomes: Mutex::new(VecDeque::new()),
            spawns: Mutex::new(Vec::new()),
            resizes: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn push_outcome(&self, outcome: SpawnOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn spawns(&self) -> Vec<CommandSpec> {
        self.spawns.lock().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }
}

struct StubControl {
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
}

#[async_trait]
impl ProcessControl for StubControl {
    async fn set_tty_size(&self, rows: u16, cols: u16) -> Result<(), SpriteError> {
        self.resizes.lock().unwrap().push((rows, cols));
        Ok(())
    }
}

#[async_trait]
impl SpriteHandle for StubSprite {
    fn name(&self) -> &str {
        &self.name
    }

    async fn spawn(&self, spec: CommandSpec) -> Result<RemoteProcess, SpriteError> {
        self.spawns.lock().unwrap().push(spec);
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SpawnOutcome::Exit {
                code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            });

        let control = Arc::new(StubControl {
            resizes: self.resizes.clone(),
        });

        match outcome {
            SpawnOutcome::Fail(message) => Err(SpriteError::Api(message)),
            SpawnOutcome::Exit {
                code,
                stdout,
                stderr,
            } => {
                let (stdin_local, stdin_remote) = tokio::io::duplex(64 * 1024);
                let (mut stdout_writer, stdout_local) = tokio::io::duplex(64 * 1024);
                let (mut stderr_writer, stderr_local) = tokio::io::duplex(64 * 1024);
                let exit = Box::pin(async move {
                    let _ = stdout_writer.write_all(&stdout).await;
                    let _ = stderr_writer.write_all(&stderr).await;
                    drop(stdout_writer);
                    drop(stderr_writer);
                    drop(stdin_remote);
                    Ok(code)
                });
                Ok(RemoteProcess {
                    stdin: Box::new(stdin_local),
                    stdout: Box::new(stdout_local),
                    stderr: Box::new(stderr_local),
                    control,
                    exit,
                })
            }
            SpawnOutcome::RunUntilStdinEof => {
                let (stdin_local, mut stdin_remote) = tokio::io::duplex(64 * 1024);
                let (stdout_writer, stdout_local) = tokio::io::duplex(64 * 1024);
                let (stderr_writer, stderr_local) = tokio::io::duplex(64 * 1024);
                let exit = Box::pin(async move {
                    let mut sink = Vec::new();
                    let _ = stdin_remote.read_to_end(&mut sink).await;
                    drop(stdout_writer);
                    drop(stderr_writer);
                    Ok(0)
                });
                Ok(RemoteProcess {
                    stdin: Box::new(stdin_local),
                    stdout: Box::new(stdout_local),
                    stderr: Box::new(stderr_local),
                    control,
                    exit,
                })
            }
        }
    }
}

/// Directory over a fixed set of stub sprites.
pub struct StubDirectory {
    sprites: HashMap<String, Arc<StubSprite>>,
}

impl StubDirectory {
    pub fn with(sprites: Vec<Arc<StubSprite>>) -> Arc<Self> {
        Arc::new(Self {
            sprites: sprites
                .into_iter()
                .map(|s| (s.name().to_string(), s))
                .collect(),
        })
    }
}

#[async_trait]
impl SpriteDirectory for StubDirectory {
    async fn lookup(&self, name: &str) -> Result<Arc<dyn SpriteHandle>, SpriteError> {
        self.sprites
            .get(name)
            .cloned()
            .map(|s| s as Arc<dyn SpriteHandle>)
            .ok_or_else(|| SpriteError::NotFound(name.to_string()))
    }
}

/// A running spritessh server bound to an ephemeral port.
pub struct TestServer {
    pub port: u16,
    pub server: Arc<Server>,
    pub _serve: tokio::task::JoinHandle<()>,
}

pub async fn start_server(directory: Arc<dyn SpriteDirectory>) -> TestServer {
    start_server_with_api(directory, "http://127.0.0.1:1").await
}

/// Start a server whose credentials point at `api_url` (used by the
/// forwarding tests to stand up a fake proxy endpoint).
pub async fn start_server_with_api(
    directory: Arc<dyn SpriteDirectory>,
    api_url: &str,
) -> TestServer {
    let mut config = AppConfig::default();
    config.server.listen = "127.0.0.1:0".to_string();
    config.server.max_retries = 5;

    let credentials = ApiCredentials {
        api_url: api_url.trim_end_matches('/').to_string(),
        token: "test-token".to_string(),
        org: "testorg".to_string(),
    };
    let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();

    let server = Arc::new(Server::new(
        Arc::new(config),
        directory,
        credentials,
        host_key,
    ));
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let serve = {
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        })
    };

    TestServer {
        port,
        server,
        _serve: serve,
    }
}

/// Connect a russh client and authenticate as `user` with a fresh key.
pub async fn connect(port: u16, user: &str) -> russh::client::Handle<TestClientHandler> {
    let config = Arc::new(russh::client::Config::default());
    let mut handle = russh::client::connect(config, ("127.0.0.1", port), TestClientHandler)
        .await
        .unwrap();

    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let auth = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), None))
        .await
        .unwrap();
    assert!(auth.success(), "publickey auth should succeed");
    handle
}
