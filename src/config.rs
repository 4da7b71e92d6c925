use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::auth::{AccessLevel, Credential};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Storage root.  Repositories live under `{data_path}/repos`.
    pub data_path: PathBuf,
    #[serde(default)]
    pub ssh: SshConfig,
    /// Optional metrics / health listener.
    #[serde(default)]
    pub http: Option<HttpConfig>,
    /// Public keys (authorized_keys format) that are always admitted,
    /// regardless of what the backend says.
    #[serde(default)]
    pub initial_admin_keys: Vec<String>,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Seconds to wait for in-flight sessions on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

fn default_shutdown_grace() -> u64 {
    30
}

impl Config {
    /// Directory that holds every bare repository.
    pub fn repos_dir(&self) -> PathBuf {
        self.data_path.join("repos")
    }

    /// Host key location; relative paths are resolved against `data_path`.
    pub fn host_key_path(&self) -> PathBuf {
        if self.ssh.key_path.is_absolute() {
            self.ssh.key_path.clone()
        } else {
            self.data_path.join(&self.ssh.key_path)
        }
    }

    /// Parsed bootstrap administrator keys.
    pub fn admin_keys(&self) -> Result<Vec<Credential>> {
        self.initial_admin_keys
            .iter()
            .map(|line| {
                Credential::parse(line).with_context(|| format!("invalid initial admin key: {line:?}"))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Socket address for the SSH listener (e.g. `0.0.0.0:23231`).
    #[serde(default = "default_ssh_listen")]
    pub listen_addr: String,
    /// Host key file.  Generated on first start when missing.
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    /// Seconds of inactivity before a connection is dropped (0 disables).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Maximum seconds a single command may run (0 disables).
    #[serde(default)]
    pub max_timeout: u64,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: usize,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_ssh_listen(),
            key_path: default_key_path(),
            idle_timeout: default_idle_timeout(),
            max_timeout: 0,
            max_auth_attempts: default_max_auth_attempts(),
        }
    }
}

impl SshConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.idle_timeout)
    }

    pub fn max_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.max_timeout)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn default_ssh_listen() -> String {
    "0.0.0.0:23231".to_string()
}

fn default_key_path() -> PathBuf {
    PathBuf::from("ssh/gitgate_host_ed25519")
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_auth_attempts() -> usize {
    3
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Socket address for `/metrics` and `/healthz` (e.g. `127.0.0.1:23233`).
    pub listen_addr: String,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Admit connections that present no public key.
    #[serde(default = "bool_true")]
    pub allow_keyless: bool,
    /// Access granted to keys that match no configured user.
    #[serde(default = "default_anon_access")]
    pub anon_access: AccessLevel,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            allow_keyless: true,
            anon_access: default_anon_access(),
            users: Vec::new(),
            repos: Vec::new(),
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_anon_access() -> AccessLevel {
    AccessLevel::ReadOnly
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub admin: bool,
    /// authorized_keys lines.
    #[serde(default)]
    pub public_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    pub name: String,
    #[serde(default)]
    pub private: bool,
    /// User names granted read-write access.
    #[serde(default)]
    pub collaborators: Vec<String>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config file: {}", path.display()))
}

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.data_path.is_absolute(),
        "data_path must be an absolute path"
    );
    config.admin_keys()?;
    for user in &config.backend.users {
        anyhow::ensure!(!user.name.trim().is_empty(), "user names must not be empty");
        for key in &user.public_keys {
            Credential::parse(key)
                .with_context(|| format!("invalid public key for user {:?}", user.name))?;
        }
    }
    for repo in &config.backend.repos {
        anyhow::ensure!(
            !crate::git::RepoName::sanitize(&repo.name).is_empty(),
            "invalid repository name: {:?}",
            repo.name
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credential::tests::{ALICE_KEY, BOB_KEY};

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config("data_path: /var/lib/gitgate\n").unwrap();
        assert_eq!(config.repos_dir(), PathBuf::from("/var/lib/gitgate/repos"));
        assert_eq!(config.ssh.listen_addr, "0.0.0.0:23231");
        assert_eq!(
            config.host_key_path(),
            PathBuf::from("/var/lib/gitgate/ssh/gitgate_host_ed25519")
        );
        assert_eq!(config.ssh.idle_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.ssh.max_timeout(), None);
        assert!(config.backend.allow_keyless);
        assert_eq!(config.backend.anon_access, AccessLevel::ReadOnly);
        assert!(config.http.is_none());
        assert_eq!(config.shutdown_grace, 30);
    }

    #[test]
    fn full_config() {
        let yaml = format!(
            r#"
data_path: /srv/git
ssh:
  listen_addr: 127.0.0.1:2222
  key_path: /etc/gitgate/host_key
  idle_timeout: 0
  max_timeout: 3600
http:
  listen_addr: 127.0.0.1:9100
initial_admin_keys:
  - "{ALICE_KEY}"
backend:
  allow_keyless: false
  anon_access: no-access
  users:
    - name: bob
      public_keys: ["{BOB_KEY}"]
  repos:
    - name: secret
      private: true
      collaborators: [bob]
"#
        );
        let config = parse_config(&yaml).unwrap();
        assert_eq!(config.host_key_path(), PathBuf::from("/etc/gitgate/host_key"));
        assert_eq!(config.ssh.idle_timeout(), None);
        assert_eq!(config.ssh.max_timeout(), Some(Duration::from_secs(3600)));
        assert_eq!(config.http.as_ref().unwrap().listen_addr, "127.0.0.1:9100");
        assert_eq!(config.admin_keys().unwrap().len(), 1);
        assert!(!config.backend.allow_keyless);
        assert_eq!(config.backend.anon_access, AccessLevel::NoAccess);
        assert_eq!(config.backend.repos[0].collaborators, vec!["bob".to_string()]);
    }

    #[test]
    fn relative_data_path_is_rejected() {
        assert!(parse_config("data_path: data\n").is_err());
    }

    #[test]
    fn invalid_admin_key_is_rejected() {
        let yaml = "data_path: /srv/git\ninitial_admin_keys: [\"ssh-ed25519 nope\"]\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn unknown_access_level_is_rejected() {
        let yaml = "data_path: /srv/git\nbackend:\n  anon_access: superuser\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn traversal_only_repo_name_is_rejected() {
        let yaml = "data_path: /srv/git\nbackend:\n  repos:\n    - name: ../..\n";
        assert!(parse_config(yaml).is_err());
    }
}
