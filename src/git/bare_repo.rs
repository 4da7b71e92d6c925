//! Bare Git repository helpers.
//!
//! Initialisation shells out to `git init --bare`; validation and discovery
//! are plain filesystem checks.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::sanitize::BARE_SUFFIX;

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Initialise a new bare Git repository at `path`.
///
/// Creates the directory (and any missing parents) and runs
/// `git init --bare`.  If the directory already contains a valid bare repo
/// (i.e. has a `HEAD` file), this is a no-op.
#[instrument(fields(path = %path.display()))]
pub async fn init_bare_repo(path: &Path) -> Result<()> {
    if validate_bare_repo(path).await? {
        debug!("bare repo already exists; skipping init");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent directory: {}", parent.display()))?;
    }

    let output = Command::new("git")
        .arg("init")
        .arg("--bare")
        .arg("--quiet")
        .arg(path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await
        .context("failed to spawn git init --bare")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Check whether `path` looks like a valid bare Git repository.
///
/// A bare repo must be a directory that contains a `HEAD` file.  This is a
/// lightweight heuristic, not a full integrity check.
#[instrument(fields(path = %path.display()))]
pub async fn validate_bare_repo(path: &Path) -> Result<bool> {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    if !is_dir {
        debug!("path does not exist or is not a directory");
        return Ok(false);
    }

    let head_exists = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);

    if !head_exists {
        debug!("HEAD file not found; not a valid bare repo");
        return Ok(false);
    }

    let objects_ok = tokio::fs::metadata(path.join("objects"))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    if !objects_ok {
        warn!(path = %path.display(), "HEAD exists but objects/ directory is missing");
    }

    Ok(true)
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Walk `root` and return the names (relative to `root`, without the `.git`
/// suffix) of every bare repository found.  Repositories are not descended
/// into; symlinks are not followed.
#[instrument(fields(root = %root.display()))]
pub async fn discover_repos(root: &Path) -> Result<Vec<String>> {
    let root = root.to_path_buf();

    // File-system walking is synchronous; run it in a blocking task to
    // avoid starving the Tokio runtime.
    let names = tokio::task::spawn_blocking(move || discover_sync(&root))
        .await
        .context("blocking task panicked")?;

    debug!(count = names.len(), "discovered bare repos");
    Ok(names)
}

fn discover_sync(root: &Path) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(err) => {
                if current != root {
                    warn!(
                        path = %current.display(),
                        error = %err,
                        "failed to read directory during repo discovery"
                    );
                }
                continue;
            }
        };

        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let path = entry.path();
            let is_bare = path.join("HEAD").is_file();
            let Some(relative) = path.strip_prefix(root).ok().and_then(|p| p.to_str()) else {
                continue;
            };
            match relative.strip_suffix(BARE_SUFFIX) {
                Some(name) if is_bare && !name.is_empty() => found.push(name.replace('\\', "/")),
                _ if !is_bare => stack.push(path),
                _ => {}
            }
        }
    }

    found.sort();
    found
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_bare(path: &Path) {
        std::fs::create_dir_all(path.join("objects")).unwrap();
        std::fs::create_dir_all(path.join("refs")).unwrap();
        std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    }

    #[tokio::test]
    async fn validate_nonexistent_path() {
        let tmp = tempfile::tempdir().unwrap();
        let result = validate_bare_repo(&tmp.path().join("missing.git")).await.unwrap();
        assert!(!result);
    }

    #[tokio::test]
    async fn validate_dir_without_head() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!validate_bare_repo(tmp.path()).await.unwrap());
    }

    #[tokio::test]
    async fn validate_fake_bare_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("r.git");
        fake_bare(&repo);
        assert!(validate_bare_repo(&repo).await.unwrap());
    }

    #[tokio::test]
    async fn init_is_noop_for_existing_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("r.git");
        fake_bare(&repo);
        std::fs::write(repo.join("marker"), "keep").unwrap();
        init_bare_repo(&repo).await.unwrap();
        assert!(repo.join("marker").is_file());
    }

    #[tokio::test]
    async fn discover_finds_nested_repos() {
        let tmp = tempfile::tempdir().unwrap();
        fake_bare(&tmp.path().join("alpha.git"));
        fake_bare(&tmp.path().join("org/beta.git"));
        std::fs::create_dir_all(tmp.path().join("org/not-a-repo")).unwrap();
        std::fs::create_dir_all(tmp.path().join("empty.git")).unwrap();

        let names = discover_repos(tmp.path()).await.unwrap();
        assert_eq!(names, vec!["alpha".to_string(), "org/beta".to_string()]);
    }

    #[tokio::test]
    async fn discover_missing_root_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let names = discover_repos(&tmp.path().join("nope")).await.unwrap();
        assert!(names.is_empty());
    }
}
