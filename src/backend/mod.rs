//! Repository and access-level backend.
//!
//! The gateway consults a [`Backend`] for every authorization decision and
//! for repository auto-creation.  Calls may be slow; errors are propagated to
//! the caller without retry.

pub mod local;

use anyhow::Result;

use crate::auth::{AccessLevel, Credential};

pub use local::LocalBackend;

/// Options applied when a repository is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryOptions {
    pub private: bool,
}

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Access level `credential` holds on repository `repo`.  The empty
    /// name denotes the global scope.  `None` is a keyless connection.
    async fn access_level(&self, repo: &str, credential: Option<&Credential>)
        -> Result<AccessLevel>;

    /// Whether connections without a public key may proceed at all.
    async fn allow_keyless(&self) -> bool;

    async fn repository_exists(&self, name: &str) -> Result<bool>;

    /// Create-if-absent.  Succeeds when the repository already exists.
    async fn create_repository(&self, name: &str, options: RepositoryOptions) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Scriptable in-memory backend.  The access level is looked up by
    /// repository name only; `None` credentials get `keyless_level`.
    #[derive(Default)]
    pub struct FakeBackend {
        pub allow_keyless: bool,
        pub levels: HashMap<String, AccessLevel>,
        pub keyless_level: AccessLevel,
        pub fail_lookup: bool,
        pub fail_create: bool,
        pub existing: Mutex<HashSet<String>>,
        pub created: Mutex<Vec<String>>,
        pub lookups: AtomicUsize,
    }

    impl FakeBackend {
        pub fn with_level(mut self, repo: &str, level: AccessLevel) -> Self {
            self.levels.insert(repo.to_string(), level);
            self
        }

        pub fn with_repo(self, repo: &str) -> Self {
            self.existing.lock().unwrap().insert(repo.to_string());
            self
        }

        pub fn created(&self) -> Vec<String> {
            self.created.lock().unwrap().clone()
        }

        pub fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Backend for FakeBackend {
        async fn access_level(
            &self,
            repo: &str,
            credential: Option<&Credential>,
        ) -> Result<AccessLevel> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(!self.fail_lookup, "backend unavailable");
            if credential.is_none() {
                return Ok(self.keyless_level);
            }
            Ok(self.levels.get(repo).copied().unwrap_or_default())
        }

        async fn allow_keyless(&self) -> bool {
            self.allow_keyless
        }

        async fn repository_exists(&self, name: &str) -> Result<bool> {
            Ok(self.existing.lock().unwrap().contains(name))
        }

        async fn create_repository(&self, name: &str, _options: RepositoryOptions) -> Result<()> {
            anyhow::ensure!(!self.fail_create, "disk full");
            self.existing.lock().unwrap().insert(name.to_string());
            self.created.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }
}
