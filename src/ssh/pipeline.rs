//! Per-command middleware chain.
//!
//! Every exec (or shell) request becomes a [`GitSession`] that is handed to
//! an ordered [`Pipeline`].  Each [`Middleware`] may act on the session and
//! then hand it on through [`Next`]; the chain is modelled on axum's
//! `middleware::Next`, minus the request/response split.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::auth::Credential;
use crate::error::DispatchError;
use crate::git::{pktline, Invocation, SessionStreams};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// State derived from one command on one SSH channel.  Owned exclusively by
/// the task running the pipeline.
pub struct GitSession {
    user: String,
    credential: Option<Credential>,
    command: Vec<String>,
    git_protocol: Option<String>,
    streams: SessionStreams,
    exit_status: Option<u32>,
}

impl GitSession {
    pub fn new(
        user: impl Into<String>,
        credential: Option<Credential>,
        command: Vec<String>,
        git_protocol: Option<String>,
        streams: SessionStreams,
    ) -> Self {
        Self {
            user: user.into(),
            credential,
            command,
            git_protocol,
            streams,
            exit_status: None,
        }
    }

    /// Claimed identity (the SSH user name).  Not authenticated by itself.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Credential encoding used as a metric label; empty when keyless.
    pub fn key_label(&self) -> String {
        self.credential
            .as_ref()
            .map(Credential::encoding)
            .unwrap_or_default()
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn git_protocol(&self) -> Option<&str> {
        self.git_protocol.as_deref()
    }

    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }

    /// Record the status the channel will close with.  The first call wins.
    pub fn exit(&mut self, code: u32) {
        self.exit_status.get_or_insert(code);
    }

    pub fn streams_mut(&mut self) -> &mut SessionStreams {
        &mut self.streams
    }

    /// Streams and negotiated protocol borrowed together for an executor.
    pub fn io_parts(&mut self) -> (&mut SessionStreams, Option<&str>) {
        (&mut self.streams, self.git_protocol.as_deref())
    }

    /// Report `err` to the client as a pkt-line on stdout and exit with 1.
    pub async fn fatal(&mut self, err: DispatchError) {
        let line = pktline::encode_error(&err.to_string());
        let stdout = &mut self.streams.stdout;
        if let Err(e) = async {
            stdout.write_all(&line).await?;
            stdout.flush().await
        }
        .await
        {
            warn!(error = %e, "failed to write fatal response");
        }
        self.exit(1);
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, session: &mut GitSession, next: Next<'_>) -> Result<()>;
}

/// The remainder of the chain after the current link.
pub struct Next<'a> {
    links: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    pub async fn run(self, session: &mut GitSession) -> Result<()> {
        match self.links.split_first() {
            Some((link, rest)) => link.handle(session, Next { links: rest }).await,
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    links: Arc<[Arc<dyn Middleware>]>,
}

impl Pipeline {
    /// Links run in the given order; the first one sees the session first.
    pub fn new(links: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            links: links.into(),
        }
    }

    pub async fn run(&self, session: &mut GitSession) -> Result<()> {
        Next { links: &self.links }.run(session).await
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logs every command on entry and its exit status once the rest of the
/// chain returns.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, session: &mut GitSession, next: Next<'_>) -> Result<()> {
        let started = Instant::now();
        let fingerprint = session.credential().map(Credential::fingerprint);
        info!(
            user = %session.user(),
            fingerprint = ?fingerprint,
            command = ?session.command(),
            git_protocol = session.git_protocol().unwrap_or_default(),
            "command started"
        );

        let result = next.run(session).await;

        info!(
            user = %session.user(),
            exit_status = session.exit_status().unwrap_or(0),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "command finished"
        );
        result
    }
}

// ---------------------------------------------------------------------------
// Terminal link
// ---------------------------------------------------------------------------

/// Last link of the chain.  Anything that reaches it without an exit status
/// and is not a git invocation is rejected on stderr.
pub struct UnsupportedCommand;

#[async_trait]
impl Middleware for UnsupportedCommand {
    async fn handle(&self, session: &mut GitSession, next: Next<'_>) -> Result<()> {
        if session.exit_status().is_some() || Invocation::parse(session.command()).is_some() {
            return next.run(session).await;
        }

        let message = match session.command().first() {
            None => "Interactive sessions are not supported; only git commands are.\n".to_string(),
            Some(verb) => format!("ERROR: Unknown command {verb:?}. Only git commands are supported.\n"),
        };
        let stderr = &mut session.streams_mut().stderr;
        stderr.write_all(message.as_bytes()).await?;
        stderr.flush().await?;
        session.exit(1);

        next.run(session).await
    }
}
