//! Git command dispatch.
//!
//! For each git invocation: parse, guard the repository path, authorize
//! against the backend, auto-create on push, run the executor, report.  Every
//! failure is answered with a single fatal pkt-line; the rest of the chain
//! always runs afterwards.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use super::pipeline::{GitSession, Middleware, Next};
use crate::auth::{AccessLevel, Credential};
use crate::backend::{Backend, RepositoryOptions};
use crate::error::{DispatchError, ExecError};
use crate::git::guard::{clean_path, ensure_resolved_within, ensure_token_contained, ensure_within};
use crate::git::{Executor, GitCommand, Invocation, RepoName};
use crate::metrics::Recorder;

pub struct GitDispatch {
    repos_dir: PathBuf,
    /// Bootstrap administrators; resolved to `Admin` without asking the
    /// backend.
    admin_keys: HashSet<Credential>,
    backend: Arc<dyn Backend>,
    executor: Arc<dyn Executor>,
    recorder: Arc<dyn Recorder>,
}

impl GitDispatch {
    pub fn new(
        repos_dir: impl Into<PathBuf>,
        backend: Arc<dyn Backend>,
        executor: Arc<dyn Executor>,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        Self {
            repos_dir: clean_path(&repos_dir.into()),
            admin_keys: HashSet::new(),
            backend,
            executor,
            recorder,
        }
    }

    pub fn with_admin_keys(mut self, keys: impl IntoIterator<Item = Credential>) -> Self {
        self.admin_keys.extend(keys);
        self
    }

    async fn resolve_access(
        &self,
        repo: &RepoName,
        credential: Option<&Credential>,
    ) -> Result<AccessLevel, DispatchError> {
        if credential.is_some_and(|c| self.admin_keys.contains(c)) {
            debug!("bootstrap administrator key");
            return Ok(AccessLevel::Admin);
        }
        self.backend
            .access_level(repo.as_str(), credential)
            .await
            .map_err(|e| {
                error!(error = %e, "access lookup failed");
                DispatchError::SystemMalfunction
            })
    }

    #[instrument(skip_all, fields(%command, repo = %raw_repo, user = %session.user()))]
    async fn dispatch(
        &self,
        session: &mut GitSession,
        command: GitCommand,
        raw_repo: &str,
    ) -> Result<(), DispatchError> {
        // -- Guard ------------------------------------------------------------
        ensure_token_contained(raw_repo)?;
        let name = RepoName::sanitize(raw_repo);
        if name.is_empty() {
            warn!("repository name is empty after sanitising");
            return Err(DispatchError::Containment);
        }
        let repo_path = ensure_within(&self.repos_dir, &name.canonical())?;
        ensure_resolved_within(&self.repos_dir, &repo_path)?;

        // -- Authorize --------------------------------------------------------
        let access = self.resolve_access(&name, session.credential()).await?;
        debug!(%access, required = %command.required_access(), "access resolved");
        if access < command.required_access() {
            warn!(%access, "not authorized");
            return Err(DispatchError::NotAuthorized);
        }

        let key = session.key_label();

        // -- Provision --------------------------------------------------------
        if command == GitCommand::ReceivePack {
            self.provision(&name, &key, session.user()).await?;
        }

        // -- Execute ----------------------------------------------------------
        let (streams, git_protocol) = session.io_parts();
        match self
            .executor
            .execute(command, streams, &repo_path, git_protocol)
            .await
        {
            Ok(()) => {}
            Err(ExecError::InvalidRepository) => {
                warn!(path = %repo_path.display(), "not a valid repository");
                return Err(DispatchError::InvalidRepository);
            }
            Err(ExecError::Failed(e)) => {
                error!(error = %e, "git command failed");
                return Err(DispatchError::SystemMalfunction);
            }
        }

        self.recorder
            .git_command(command, &key, session.user(), name.as_str());
        Ok(())
    }

    /// Create the repository if the backend does not know it yet.
    async fn provision(&self, name: &RepoName, key: &str, user: &str) -> Result<(), DispatchError> {
        let exists = self
            .backend
            .repository_exists(name.as_str())
            .await
            .map_err(|e| {
                error!(error = %e, "repository lookup failed");
                DispatchError::SystemMalfunction
            })?;
        if exists {
            return Ok(());
        }

        self.backend
            .create_repository(name.as_str(), RepositoryOptions { private: false })
            .await
            .map_err(|e| {
                error!(error = %e, "failed to create repository");
                DispatchError::SystemMalfunction
            })?;
        self.recorder.repository_created(key, user, name.as_str());
        info!(repo = %name, "created repository on push");
        Ok(())
    }
}

#[async_trait]
impl Middleware for GitDispatch {
    async fn handle(&self, session: &mut GitSession, next: Next<'_>) -> Result<()> {
        let parsed = Invocation::parse(session.command()).map(|inv| (inv.command, inv.repo.to_string()));

        if let Some((command, raw_repo)) = parsed {
            if let Err(err) = self.dispatch(session, command, &raw_repo).await {
                session.fatal(err).await;
            }
        }

        next.run(session).await
    }
}
