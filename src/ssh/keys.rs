use anyhow::{Context, Result};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::PrivateKey;
use std::path::{Path, PathBuf};

const DEFAULT_HOST_KEY_NAME: &str = "spritessh_host_ed25519_key";
const HOST_KEY_COMMENT: &str = "sprite@spritessh";

/// Default host key location under the user's SSH directory.
pub fn default_host_key_path() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("cannot determine home directory")?;
    Ok(PathBuf::from(home).join(".ssh").join(DEFAULT_HOST_KEY_NAME))
}

/// Load the Ed25519 host key at `path`, generating and persisting a fresh
/// one if the file does not exist. Any partial write is a startup failure.
pub fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        load_host_key(path)
    } else {
        generate_host_key(path)
    }
}

fn load_host_key(path: &Path) -> Result<PrivateKey> {
    let key = russh::keys::load_secret_key(path, None)
        .with_context(|| format!("loading host key: {}", path.display()))?;
    if !matches!(key.algorithm(), Algorithm::Ed25519) {
        anyhow::bail!(
            "host key at {} is not Ed25519 (got {})",
            path.display(),
            key.algorithm()
        );
    }
    Ok(key)
}

fn generate_host_key(path: &Path) -> Result<PrivateKey> {
    tracing::info!(path = %path.display(), "Generating Ed25519 host key");
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("Ed25519 key generation failed")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_private_dir(parent)
                .with_context(|| format!("creating directory: {}", parent.display()))?;
        }
    }

    let pem = key
        .to_openssh(LineEnding::LF)
        .context("encoding host key")?;
    write_private(path, pem.as_bytes())
        .with_context(|| format!("writing host key: {}", path.display()))?;

    let public = format!(
        "{} {}\n",
        key.public_key()
            .to_openssh()
            .context("encoding public key")?
            .trim_end(),
        HOST_KEY_COMMENT
    );
    let pub_path = public_key_path(path);
    write_public(&pub_path, public.as_bytes())
        .with_context(|| format!("writing public key: {}", pub_path.display()))?;

    Ok(key)
}

/// Companion `.pub` file next to the private key.
pub fn public_key_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.pub", path.display()))
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Write with restrictive permissions from the start (no TOCTOU window).
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

#[cfg(unix)]
fn write_public(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn write_public(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
