//! Containment check for repository paths.
//!
//! Runs after sanitisation and before anything touches the filesystem or
//! spawns a process.  The lexical check is independent of the filesystem;
//! [`ensure_resolved_within`] additionally resolves whatever part of the path
//! already exists so a symlink inside the storage root cannot redirect a
//! repository outside it.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

#[derive(Debug, thiserror::Error)]
#[error("path escapes the repository root")]
pub struct ContainmentError;

/// Lexically normalise `path`: drop `.` components and fold `..` into the
/// preceding component.  `..` directly under the root is discarded.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Join `candidate` onto `root` and verify the result is strictly nested
/// inside `root`.  Returns the cleaned, joined path.
pub fn ensure_within(root: &Path, candidate: &str) -> Result<PathBuf, ContainmentError> {
    let root = clean_path(root);
    if candidate.is_empty() {
        debug!(root = %root.display(), "empty repository path");
        return Err(ContainmentError);
    }
    let joined = clean_path(&root.join(candidate));
    if joined == root || !joined.starts_with(&root) {
        debug!(root = %root.display(), candidate, "illegal repository path");
        return Err(ContainmentError);
    }
    Ok(joined)
}

/// Reject a raw client token whose `..` segments would climb above the
/// namespace root.  Leading separators anchor the token at the root rather
/// than at the filesystem root, so `/org/r.git` is accepted.
pub fn ensure_token_contained(token: &str) -> Result<(), ContainmentError> {
    let mut depth = 0usize;
    for segment in token.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    debug!(token, "repository token climbs above the root");
                    ContainmentError
                })?;
            }
            _ => depth += 1,
        }
    }
    Ok(())
}

/// Resolve the deepest existing ancestor of `path` (which must already have
/// passed [`ensure_within`]) and verify it is still physically inside
/// `root`.  Paths that do not exist yet below an in-root ancestor pass.
pub fn ensure_resolved_within(root: &Path, path: &Path) -> Result<(), ContainmentError> {
    let Ok(real_root) = root.canonicalize() else {
        // Nothing beneath a missing root can exist either.
        return Ok(());
    };

    for ancestor in path.ancestors() {
        if ancestor == root || !ancestor.starts_with(root) {
            break;
        }
        let Ok(real) = ancestor.canonicalize() else {
            continue;
        };
        let nested = real.starts_with(&real_root) && (ancestor != path || real != real_root);
        if !nested {
            debug!(path = %path.display(), resolved = %real.display(), "repository path resolves outside root");
            return Err(ContainmentError);
        }
        return Ok(());
    }
    Ok(())
}
