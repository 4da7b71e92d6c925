//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus_client::metrics::gauge::Gauge;
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tokio::sync::Notify;
use tracing::{info, warn};

use super::session::SshSession;
use crate::AppState;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    state: Arc<AppState>,
}

impl SshServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(
            peer = ?peer_addr,
            "new SSH client connection",
        );
        SshSession::new(Arc::clone(&self.state), peer_addr)
    }
}

// ---------------------------------------------------------------------------
// Active session tracking
// ---------------------------------------------------------------------------

/// Counts running commands so shutdown can wait for them to finish.
#[derive(Clone)]
pub struct ActiveSessions {
    inner: Arc<ActiveInner>,
}

struct ActiveInner {
    count: AtomicUsize,
    idle: Notify,
    gauge: Gauge,
}

/// Held by a running command; decrements the count on drop.
pub struct SessionGuard {
    inner: Arc<ActiveInner>,
}

impl ActiveSessions {
    pub fn new(gauge: Gauge) -> Self {
        Self {
            inner: Arc::new(ActiveInner {
                count: AtomicUsize::new(0),
                idle: Notify::new(),
                gauge,
            }),
        }
    }

    pub fn enter(&self) -> SessionGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        self.inner.gauge.inc();
        SessionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until no command is running.  Returns `false` if `grace` elapsed
    /// first.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, idle).await.is_ok()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.inner.gauge.dec();
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Server key loading
// ---------------------------------------------------------------------------

/// Load the host key from `path`, or generate an Ed25519 key and persist it
/// there (mode 0600) when the file does not exist yet.
fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load SSH host key: {}", path.display()))?;
        info!(path = %path.display(), "loaded SSH host key");
        return Ok(key);
    }

    warn!(path = %path.display(), "SSH host key not found; generating Ed25519 key");
    let key = KeyPair::generate_ed25519();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create key directory: {}", parent.display()))?;
    }

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("failed to encode SSH host key")?;
    write_private(path, &pem)
        .with_context(|| format!("failed to write SSH host key: {}", path.display()))?;
    Ok(key)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Authentication methods offered to clients.  `none` is left out: OpenSSH
/// tries it first and would otherwise skip public-key auth entirely.
pub(crate) fn auth_methods() -> MethodSet {
    MethodSet::PUBLICKEY | MethodSet::KEYBOARD_INTERACTIVE
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Run the SSH listener until `shutdown` resolves, then give running commands
/// up to `shutdown_grace` seconds to finish.
pub async fn start_ssh_server(
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let ssh = &state.config.ssh;
    let listen_addr: SocketAddr = ssh
        .listen_addr
        .parse()
        .with_context(|| format!("invalid SSH listen address: {:?}", ssh.listen_addr))?;

    // -- Build russh server config ----------------------------------------

    let host_key = load_or_generate_host_key(&state.config.host_key_path())?;

    let config = Arc::new(server::Config {
        keys: vec![host_key],
        methods: auth_methods(),
        preferred: russh::Preferred::DEFAULT,
        inactivity_timeout: ssh.idle_timeout(),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: ssh.max_auth_attempts,
        ..Default::default()
    });

    // -- Start serving ----------------------------------------------------

    info!(address = %listen_addr, "starting SSH server");

    let mut ssh_server = SshServer::new(Arc::clone(&state));
    tokio::select! {
        res = ssh_server.run_on_address(config, listen_addr) => {
            res.context("SSH server exited with error")?;
        }
        () = shutdown => {
            info!("SSH server stopped accepting connections");
        }
    }

    let grace = Duration::from_secs(state.config.shutdown_grace);
    let running = state.sessions.count();
    if running > 0 {
        info!(running, grace_secs = grace.as_secs(), "waiting for running commands");
        if !state.sessions.wait_idle(grace).await {
            warn!(remaining = state.sessions.count(), "shutdown grace elapsed; abandoning commands");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use russh_keys::PublicKeyBase64;

    use super::*;

    #[tokio::test]
    async fn tracker_counts_and_drains() {
        let gauge = Gauge::default();
        let sessions = ActiveSessions::new(gauge.clone());
        assert!(sessions.wait_idle(Duration::from_millis(10)).await);

        let first = sessions.enter();
        let second = sessions.enter();
        assert_eq!(sessions.count(), 2);
        assert_eq!(gauge.get(), 2);
        assert!(!sessions.wait_idle(Duration::from_millis(10)).await);

        drop(first);
        let waiter = tokio::spawn({
            let sessions = sessions.clone();
            async move { sessions.wait_idle(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(second);

        assert!(waiter.await.unwrap());
        assert_eq!(sessions.count(), 0);
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn none_is_not_offered() {
        let methods = auth_methods();
        assert!(!methods.contains(MethodSet::NONE));
        assert!(methods.contains(MethodSet::PUBLICKEY));
        assert!(methods.contains(MethodSet::KEYBOARD_INTERACTIVE));
    }

    #[test]
    fn host_key_is_generated_once_and_reloaded() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ssh/host_ed25519");

        let generated = load_or_generate_host_key(&path).unwrap();
        assert!(path.is_file());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let reloaded = load_or_generate_host_key(&path).unwrap();
        assert_eq!(
            generated.clone_public_key().unwrap().public_key_base64(),
            reloaded.clone_public_key().unwrap().public_key_base64()
        );
    }
}
