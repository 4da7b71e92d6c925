//! Normalisation of client-supplied repository tokens.
//!
//! The token is treated as a forward-slash path anchored at the root of the
//! repository namespace: leading separators, `.` segments and `..` segments
//! never survive, and a `..` can never climb above the namespace root.
//! Backslashes are folded to `/` first so that no platform-specific separator
//! reaches the filesystem unexamined.

/// Suffix of a bare repository directory.
pub const BARE_SUFFIX: &str = ".git";

/// A sanitised repository name (no `.git` suffix, no traversal).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoName(String);

impl RepoName {
    pub fn sanitize(raw: &str) -> Self {
        Self(sanitize_repo(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Name of the repository directory on disk (`<name>.git`).
    pub fn canonical(&self) -> String {
        format!("{}{BARE_SUFFIX}", self.0)
    }
}

impl std::fmt::Display for RepoName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sanitise a repository token.
///
/// Idempotent: `sanitize_repo(&sanitize_repo(x)) == sanitize_repo(x)`.
pub fn sanitize_repo(raw: &str) -> String {
    let raw = raw.replace('\\', "/");

    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    // Strip the bare suffix from the final segment.  A segment consisting of
    // nothing but suffixes (or collapsing to `.`/`..`) is dropped and the
    // previous one is examined instead.
    let mut tail: Option<&str> = None;
    while let Some(last) = segments.pop() {
        let mut name = last;
        while let Some(stripped) = name.strip_suffix(BARE_SUFFIX) {
            name = stripped;
        }
        if !matches!(name, "" | "." | "..") {
            tail = Some(name);
            break;
        }
    }

    match tail {
        Some(tail) => {
            segments.push(tail);
            segments.join("/")
        }
        None => String::new(),
    }
}
