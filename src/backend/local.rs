//! File-system backed [`Backend`].
//!
//! Users and per-repository policy come from the configuration file;
//! repositories are bare directories under `repos_dir`.  Repositories found
//! on disk at startup are registered as public with no collaborators.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use super::{Backend, RepositoryOptions};
use crate::auth::{AccessLevel, Credential};
use crate::config::BackendConfig;
use crate::git::{discover_repos, init_bare_repo, RepoName};

#[derive(Debug)]
struct User {
    name: String,
    admin: bool,
    keys: HashSet<Credential>,
}

#[derive(Debug, Clone, Default)]
struct RepoRecord {
    private: bool,
    collaborators: HashSet<String>,
}

pub struct LocalBackend {
    repos_dir: PathBuf,
    allow_keyless: bool,
    anon_access: AccessLevel,
    users: Vec<User>,
    repos: RwLock<HashMap<String, RepoRecord>>,
}

impl LocalBackend {
    pub fn from_config(config: &BackendConfig, repos_dir: impl Into<PathBuf>) -> Result<Self> {
        let users = config
            .users
            .iter()
            .map(|u| {
                let keys = u
                    .public_keys
                    .iter()
                    .map(|k| Credential::parse(k))
                    .collect::<Result<HashSet<_>>>()?;
                Ok(User {
                    name: u.name.clone(),
                    admin: u.admin,
                    keys,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let repos = config
            .repos
            .iter()
            .map(|r| {
                let record = RepoRecord {
                    private: r.private,
                    collaborators: r.collaborators.iter().cloned().collect(),
                };
                (RepoName::sanitize(&r.name).as_str().to_string(), record)
            })
            .collect();

        Ok(Self {
            repos_dir: repos_dir.into(),
            allow_keyless: config.allow_keyless,
            anon_access: config.anon_access,
            users,
            repos: RwLock::new(repos),
        })
    }

    /// Register every bare repository already present under `repos_dir`.
    /// Configured entries keep their policy.
    pub async fn discover(&self) -> Result<usize> {
        let names = discover_repos(&self.repos_dir).await?;
        let mut repos = self.repos.write().await;
        let before = repos.len();
        for name in names {
            repos.entry(name).or_default();
        }
        let added = repos.len() - before;
        info!(added, total = repos.len(), "registered repositories from disk");
        Ok(added)
    }

    fn user_for(&self, credential: &Credential) -> Option<&User> {
        self.users.iter().find(|u| u.keys.contains(credential))
    }
}

#[async_trait]
impl Backend for LocalBackend {
    #[instrument(skip(self, credential), fields(user = tracing::field::Empty))]
    async fn access_level(
        &self,
        repo: &str,
        credential: Option<&Credential>,
    ) -> Result<AccessLevel> {
        let user = credential.and_then(|c| self.user_for(c));
        if let Some(user) = user {
            tracing::Span::current().record("user", user.name.as_str());
        }

        let repos = self.repos.read().await;
        let record = (!repo.is_empty()).then(|| repos.get(repo)).flatten();

        let level = match (user, record) {
            (Some(user), _) if user.admin => AccessLevel::Admin,
            (Some(_), None) if repo.is_empty() => self.anon_access.max(AccessLevel::ReadOnly),
            // Known users may create repositories by pushing to them.
            (Some(_), None) => AccessLevel::ReadWrite,
            (Some(user), Some(record)) if record.collaborators.contains(&user.name) => {
                AccessLevel::ReadWrite
            }
            (Some(_), Some(record)) if record.private => AccessLevel::NoAccess,
            (Some(_), Some(_)) => self.anon_access.max(AccessLevel::ReadOnly),
            (None, Some(record)) if record.private => AccessLevel::NoAccess,
            (None, _) => self.anon_access,
        };

        debug!(%level, "resolved access level");
        Ok(level)
    }

    async fn allow_keyless(&self) -> bool {
        self.allow_keyless
    }

    async fn repository_exists(&self, name: &str) -> Result<bool> {
        Ok(self.repos.read().await.contains_key(name))
    }

    #[instrument(skip(self))]
    async fn create_repository(&self, name: &str, options: RepositoryOptions) -> Result<()> {
        let name = RepoName::sanitize(name);
        anyhow::ensure!(!name.is_empty(), "repository name is empty");

        init_bare_repo(&self.repos_dir.join(name.canonical())).await?;

        self.repos
            .write()
            .await
            .entry(name.as_str().to_string())
            .or_insert_with(|| RepoRecord {
                private: options.private,
                collaborators: HashSet::new(),
            });
        info!(repo = %name, "repository created");
        Ok(())
    }
}
