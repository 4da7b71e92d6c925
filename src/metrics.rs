use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::git::GitCommand;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PublicKeyAuthLabels {
    pub key: String,
    pub user: String,
    pub allowed: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KeyboardInteractiveLabels {
    pub user: String,
    pub allowed: String,
}

/// Shared by the per-command counters and the repository-creation counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RepoLabels {
    pub key: String,
    pub user: String,
    pub repo: String,
}

impl RepoLabels {
    pub fn new(key: &str, user: &str, repo: &str) -> Self {
        Self {
            key: key.to_string(),
            user: user.to_string(),
            repo: repo.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Side channel through which authentication and dispatch report what
/// happened.  Implementations must never influence control flow.
pub trait Recorder: Send + Sync {
    fn public_key_auth(&self, key: &str, user: &str, allowed: bool);
    fn keyboard_interactive_auth(&self, user: &str, allowed: bool);
    fn git_command(&self, command: GitCommand, key: &str, user: &str, repo: &str);
    fn repository_created(&self, key: &str, user: &str, repo: &str);
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gateway.
pub struct Metrics {
    // -- auth --
    pub public_key_auth_total: Family<PublicKeyAuthLabels, Counter>,
    pub keyboard_interactive_auth_total: Family<KeyboardInteractiveLabels, Counter>,

    // -- git commands --
    pub git_upload_pack_total: Family<RepoLabels, Counter>,
    pub git_receive_pack_total: Family<RepoLabels, Counter>,
    pub git_upload_archive_total: Family<RepoLabels, Counter>,
    pub create_repo_total: Family<RepoLabels, Counter>,

    // -- gauges --
    pub active_sessions: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let ssh = registry.sub_registry_with_prefix("gitgate_ssh");

        let public_key_auth_total = Family::<PublicKeyAuthLabels, Counter>::default();
        ssh.register(
            "public_key_auth",
            "The total number of public key auth requests",
            public_key_auth_total.clone(),
        );

        let keyboard_interactive_auth_total =
            Family::<KeyboardInteractiveLabels, Counter>::default();
        ssh.register(
            "keyboard_interactive_auth",
            "The total number of keyboard interactive auth requests",
            keyboard_interactive_auth_total.clone(),
        );

        let git_upload_pack_total = Family::<RepoLabels, Counter>::default();
        ssh.register(
            "git_upload_pack",
            "The total number of git-upload-pack requests",
            git_upload_pack_total.clone(),
        );

        let git_receive_pack_total = Family::<RepoLabels, Counter>::default();
        ssh.register(
            "git_receive_pack",
            "The total number of git-receive-pack requests",
            git_receive_pack_total.clone(),
        );

        let git_upload_archive_total = Family::<RepoLabels, Counter>::default();
        ssh.register(
            "git_upload_archive",
            "The total number of git-upload-archive requests",
            git_upload_archive_total.clone(),
        );

        let create_repo_total = Family::<RepoLabels, Counter>::default();
        ssh.register(
            "create_repo",
            "The total number of create repo requests",
            create_repo_total.clone(),
        );

        let active_sessions: Gauge = Gauge::default();
        ssh.register(
            "active_sessions",
            "Git commands currently being served",
            active_sessions.clone(),
        );

        Self {
            public_key_auth_total,
            keyboard_interactive_auth_total,
            git_upload_pack_total,
            git_receive_pack_total,
            git_upload_archive_total,
            create_repo_total,
            active_sessions,
        }
    }

    fn command_family(&self, command: GitCommand) -> Option<&Family<RepoLabels, Counter>> {
        match command {
            GitCommand::UploadPack => Some(&self.git_upload_pack_total),
            GitCommand::ReceivePack => Some(&self.git_receive_pack_total),
            GitCommand::UploadArchive => Some(&self.git_upload_archive_total),
            GitCommand::Other => None,
        }
    }

    /// Current value of the usage counter for `command` and the given labels.
    pub fn command_count(&self, command: GitCommand, labels: &RepoLabels) -> u64 {
        self.command_family(command)
            .map(|family| family.get_or_create(labels).get())
            .unwrap_or(0)
    }
}

impl Recorder for Metrics {
    fn public_key_auth(&self, key: &str, user: &str, allowed: bool) {
        self.public_key_auth_total
            .get_or_create(&PublicKeyAuthLabels {
                key: key.to_string(),
                user: user.to_string(),
                allowed: allowed.to_string(),
            })
            .inc();
    }

    fn keyboard_interactive_auth(&self, user: &str, allowed: bool) {
        self.keyboard_interactive_auth_total
            .get_or_create(&KeyboardInteractiveLabels {
                user: user.to_string(),
                allowed: allowed.to_string(),
            })
            .inc();
    }

    fn git_command(&self, command: GitCommand, key: &str, user: &str, repo: &str) {
        if let Some(family) = self.command_family(command) {
            family.get_or_create(&RepoLabels::new(key, user, repo)).inc();
        }
    }

    fn repository_created(&self, key: &str, user: &str, repo: &str) {
        self.create_repo_total
            .get_or_create(&RepoLabels::new(key, user, repo))
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_counters_are_keyed_by_kind() {
        let registry = MetricsRegistry::new();
        let metrics = &registry.metrics;
        let labels = RepoLabels::new("ssh-ed25519 AAAA", "alice", "myrepo");

        metrics.git_command(GitCommand::UploadPack, "ssh-ed25519 AAAA", "alice", "myrepo");
        metrics.git_command(GitCommand::UploadPack, "ssh-ed25519 AAAA", "alice", "myrepo");
        metrics.git_command(GitCommand::ReceivePack, "ssh-ed25519 AAAA", "alice", "myrepo");
        metrics.git_command(GitCommand::Other, "ssh-ed25519 AAAA", "alice", "myrepo");

        assert_eq!(metrics.command_count(GitCommand::UploadPack, &labels), 2);
        assert_eq!(metrics.command_count(GitCommand::ReceivePack, &labels), 1);
        assert_eq!(metrics.command_count(GitCommand::UploadArchive, &labels), 0);
        assert_eq!(metrics.command_count(GitCommand::Other, &labels), 0);
    }

    #[test]
    fn auth_counters_split_on_outcome() {
        let registry = MetricsRegistry::new();
        let metrics = &registry.metrics;
        metrics.public_key_auth("k", "alice", true);
        metrics.public_key_auth("k", "alice", false);
        metrics.public_key_auth("k", "alice", false);

        let denied = PublicKeyAuthLabels {
            key: "k".into(),
            user: "alice".into(),
            allowed: "false".into(),
        };
        assert_eq!(metrics.public_key_auth_total.get_or_create(&denied).get(), 2);
    }

    #[test]
    fn encode_includes_prefixed_names() {
        let registry = MetricsRegistry::new();
        registry.metrics.repository_created("k", "alice", "newrepo");
        registry.metrics.keyboard_interactive_auth("alice", true);
        let text = registry.encode().unwrap();
        assert!(text.contains("gitgate_ssh_create_repo_total"));
        assert!(text.contains("gitgate_ssh_keyboard_interactive_auth_total"));
        assert!(text.contains("repo=\"newrepo\""));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let registry = MetricsRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&registry.metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.git_command(GitCommand::UploadArchive, "k", "u", "r");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let labels = RepoLabels::new("k", "u", "r");
        assert_eq!(
            registry.metrics.command_count(GitCommand::UploadArchive, &labels),
            8000
        );
    }
}
