//! Protocol executors.
//!
//! The gateway never interprets the bytes of a pack exchange.  An
//! [`Executor`] receives the session's raw streams plus the repository path
//! and owns the wire protocol from there on.

use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::bare_repo::validate_bare_repo;
use super::service::GitCommand;
use crate::error::ExecError;

/// The three byte channels of a session.
pub struct SessionStreams {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

impl SessionStreams {
    pub fn new(
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Serve `command` against the bare repository at `repo_path`.
    ///
    /// `git_protocol` is the `GIT_PROTOCOL` value the client requested, if
    /// any.
    async fn execute(
        &self,
        command: GitCommand,
        streams: &mut SessionStreams,
        repo_path: &Path,
        git_protocol: Option<&str>,
    ) -> Result<(), ExecError>;
}

// ---------------------------------------------------------------------------
// git binary
// ---------------------------------------------------------------------------

/// Executor backed by the system `git` binary.
#[derive(Debug, Clone, Default)]
pub struct GitExecutor;

#[async_trait]
impl Executor for GitExecutor {
    #[instrument(skip_all, fields(%command, repo = %repo_path.display()))]
    async fn execute(
        &self,
        command: GitCommand,
        streams: &mut SessionStreams,
        repo_path: &Path,
        git_protocol: Option<&str>,
    ) -> Result<(), ExecError> {
        let subcommand = command
            .subcommand()
            .ok_or_else(|| anyhow!("{command} has no executor"))?;

        if !validate_bare_repo(repo_path).await? {
            return Err(ExecError::InvalidRepository);
        }

        let mut cmd = Command::new("git");
        cmd.arg(subcommand).arg(repo_path);

        // Forward the client's GIT_PROTOCOL so upload-pack uses the protocol
        // version the client negotiated.
        if let Some(proto) = git_protocol {
            cmd.env("GIT_PROTOCOL", proto);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn git {subcommand}"))?;

        let mut child_stdin = child.stdin.take().context("child stdin was not piped")?;
        let mut child_stdout = child.stdout.take().context("child stdout was not piped")?;
        let mut child_stderr = child.stderr.take().context("child stderr was not piped")?;

        let SessionStreams {
            stdin,
            stdout,
            stderr,
        } = streams;

        // Client → child.  Dropping `child_stdin` at the end signals EOF.
        let feed = async move {
            let copied = tokio::io::copy(stdin, &mut child_stdin).await;
            let _ = child_stdin.shutdown().await;
            copied
        };

        // Child → client.  Finishes when the child closes both pipes.
        let drain = async {
            let (out, err) = tokio::join!(
                tokio::io::copy(&mut child_stdout, stdout),
                tokio::io::copy(&mut child_stderr, stderr),
            );
            out.context("failed to relay git stdout")?;
            err.context("failed to relay git stderr")?;
            stdout.flush().await.context("failed to flush stdout")?;
            stderr.flush().await.context("failed to flush stderr")?;
            Ok::<_, anyhow::Error>(())
        };

        // The client may keep its side open after the child is done (e.g.
        // upload-archive), so input forwarding is abandoned once the output
        // side completes.
        let drained = {
            tokio::pin!(feed);
            tokio::pin!(drain);
            let mut fed = false;
            loop {
                tokio::select! {
                    res = &mut drain => break res,
                    res = &mut feed, if !fed => {
                        fed = true;
                        if let Err(e) = res {
                            debug!(error = %e, "stopped forwarding client input");
                        }
                    }
                }
            }
        };

        let status = child
            .wait()
            .await
            .with_context(|| format!("failed to wait for git {subcommand}"))?;
        drained?;

        if !status.success() {
            return Err(ExecError::Failed(anyhow!(
                "git {subcommand} exited with {status}"
            )));
        }

        debug!("git command completed");
        Ok(())
    }
}
