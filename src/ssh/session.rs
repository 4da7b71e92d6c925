//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`SshSession`].  The
//! handler authenticates the client, then turns every exec or shell request
//! into a [`GitSession`] that runs through the middleware pipeline on its own
//! task.  Channel data is bridged to the pipeline through in-memory pipes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::server::{Auth, Handle, Handler, Msg, Response, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::{debug, error, info, warn};

use super::pipeline::{GitSession, Pipeline};
use super::server::auth_methods;
use crate::auth::Credential;
use crate::git::SessionStreams;
use crate::AppState;

/// Buffer size of each in-memory pipe between a channel and the pipeline.
const PIPE_CAPACITY: usize = 64 * 1024;

/// SSH extended data type for stderr (RFC 4254 section 5.2).
const EXTENDED_DATA_STDERR: u32 = 1;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    user: String,
    /// `None` until a public key is accepted; stays `None` for keyless and
    /// keyboard-interactive logins.
    credential: Option<Credential>,
    /// `GIT_PROTOCOL` value sent by the client via SSH env request.
    git_protocol: Option<String>,
    /// Write ends of the stdin pipe of every channel with a running command.
    stdin: HashMap<ChannelId, DuplexStream>,
}

impl SshSession {
    pub fn new(state: Arc<AppState>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            state,
            peer_addr,
            user: String::new(),
            credential: None,
            git_protocol: None,
            stdin: HashMap::new(),
        }
    }

    /// Run `command` through the pipeline on a background task that owns the
    /// rest of the channel lifecycle.
    fn start_command(&mut self, channel_id: ChannelId, command: Vec<String>, session: &mut Session) {
        let (stdin_tx, stdin_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_tx, stdout_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(PIPE_CAPACITY);
        self.stdin.insert(channel_id, stdin_tx);

        let git_session = GitSession::new(
            self.user.clone(),
            self.credential.clone(),
            command,
            self.git_protocol.clone(),
            SessionStreams::new(stdin_rx, stdout_tx, stderr_tx),
        );

        let state = Arc::clone(&self.state);
        let handle = session.handle();
        let guard = state.sessions.enter();
        let peer = self.peer_addr;

        tokio::spawn(async move {
            let _guard = guard;
            let stdout_pump = tokio::spawn(pump(stdout_rx, handle.clone(), channel_id, None));
            let stderr_pump = tokio::spawn(pump(
                stderr_rx,
                handle.clone(),
                channel_id,
                Some(EXTENDED_DATA_STDERR),
            ));

            let pipeline = state.pipeline.clone();
            let exit_status =
                run_to_completion(pipeline, state.config.ssh.max_timeout(), git_session, peer).await;

            // The session, and with it the write ends of both pipes, is gone
            // by now, so the pumps drain and finish.
            let _ = stdout_pump.await;
            let _ = stderr_pump.await;

            debug!(peer = ?peer, exit_status, "closing channel");
            let _ = handle.exit_status_request(channel_id, exit_status).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
    }
}

/// Run `git_session` through `pipeline` on its own task and return the exit
/// status for the channel.  The session is dropped before this returns, which
/// closes its output pipes.  A timeout or a panic inside a link ends the
/// command with status 1.
async fn run_to_completion(
    pipeline: Pipeline,
    max_timeout: Option<Duration>,
    mut git_session: GitSession,
    peer: Option<SocketAddr>,
) -> u32 {
    let task = tokio::spawn(async move {
        let outcome = match max_timeout {
            Some(limit) => {
                let timed = tokio::time::timeout(limit, pipeline.run(&mut git_session)).await;
                timed.unwrap_or_else(|_| {
                    warn!(peer = ?peer, limit_secs = limit.as_secs(), "command exceeded max timeout");
                    git_session.exit(1);
                    Ok(())
                })
            }
            None => pipeline.run(&mut git_session).await,
        };

        match outcome {
            Ok(()) => git_session.exit_status().unwrap_or(0),
            Err(e) => {
                error!(peer = ?peer, error = %e, "command pipeline failed");
                1
            }
        }
    });

    match task.await {
        Ok(status) => status,
        Err(e) if e.is_panic() => {
            error!(peer = ?peer, "command pipeline panicked");
            1
        }
        Err(e) => {
            error!(peer = ?peer, error = %e, "command pipeline task failed");
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Channel plumbing
// ---------------------------------------------------------------------------

/// Forward everything read from `reader` to the channel, as regular data or
/// as extended data of type `ext`.  Stops at EOF or once the channel is gone;
/// dropping the reader then makes further writes from the pipeline fail.
async fn pump(mut reader: DuplexStream, handle: Handle, channel_id: ChannelId, ext: Option<u32>) {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "pipe read failed");
                break;
            }
        };
        let chunk = CryptoVec::from_slice(&buf[..n]);
        let sent = match ext {
            Some(code) => handle.extended_data(channel_id, code, chunk).await,
            None => handle.data(channel_id, chunk).await,
        };
        if sent.is_err() {
            debug!("channel closed while forwarding output");
            break;
        }
    }
}

/// Send exit-status, EOF, and close on a channel in the order required by
/// the SSH protocol (RFC 4254).
fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: u32) {
    session.exit_status_request(channel_id, exit_status);
    session.eof(channel_id);
    session.close(channel_id);
}

// ---------------------------------------------------------------------------
// Command splitting
// ---------------------------------------------------------------------------

/// Split an exec request into arguments using POSIX shell quoting rules for
/// whitespace, single quotes, double quotes and backslash escapes.  Git sends
/// `git-upload-pack 'repo.git'`; other clients may quote differently.
///
/// Returns `None` for an unterminated quote or a trailing backslash.
pub fn split_command(line: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        c => current.push(c),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => match chars.next()? {
                            c @ ('"' | '\\' | '$' | '`') => current.push(c),
                            c => {
                                current.push('\\');
                                current.push(c);
                            }
                        },
                        c => current.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                current.push(chars.next()?);
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Some(args)
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let credential = match Credential::from_public_key(key) {
            Ok(c) => c,
            Err(e) => {
                warn!(peer = ?self.peer_addr, user, error = %e, "unusable public key");
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };
        info!(
            peer = ?self.peer_addr,
            user,
            key_type = credential.key_type(),
            fingerprint = %credential.fingerprint(),
            "SSH public-key auth attempt"
        );

        if self.state.authenticator.public_key(user, Some(&credential)).await {
            self.user = user.to_string();
            self.credential = Some(credential);
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    /// Never accepted.  Clients try `none` before offering keys; keyless
    /// users come in through keyboard-interactive instead.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(peer = ?self.peer_addr, user, "SSH none auth rejected");
        Ok(Auth::Reject {
            proceed_with_methods: Some(auth_methods()),
        })
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        _response: Option<Response<'async_trait>>,
    ) -> Result<Auth, Self::Error> {
        debug!(peer = ?self.peer_addr, user, "SSH keyboard-interactive auth attempt");
        if self.state.authenticator.keyboard_interactive(user).await {
            self.user = user.to_string();
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Git clients send `GIT_PROTOCOL=version=2` here to negotiate protocol
    /// v2 with `upload-pack`.
    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.git_protocol = Some(variable_value.to_string());
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(stdin) = self.stdin.get_mut(&channel) {
            if let Err(e) = stdin.write_all(data).await {
                debug!(error = %e, "command no longer reads stdin");
                self.stdin.remove(&channel);
            }
        }
        Ok(())
    }

    /// Closing the pipe signals EOF to whatever reads the command's stdin.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(mut stdin) = self.stdin.remove(&channel) {
            let _ = stdin.shutdown().await;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdin.remove(&channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw_cmd = String::from_utf8_lossy(data);
        info!(
            peer = ?self.peer_addr,
            user = %self.user,
            command = %raw_cmd,
            "SSH exec request"
        );

        let Some(command) = split_command(&raw_cmd) else {
            warn!(command = %raw_cmd, "malformed SSH exec command");
            session.extended_data(
                channel_id,
                EXTENDED_DATA_STDERR,
                CryptoVec::from_slice(b"ERROR: Malformed command.\n"),
            );
            finish_channel(session, channel_id, 1);
            return Ok(());
        };

        session.channel_success(channel_id);
        self.start_command(channel_id, command, session);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(peer = ?self.peer_addr, user = %self.user, "SSH shell request");
        session.channel_success(channel_id);
        self.start_command(channel_id, Vec::new(), session);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
