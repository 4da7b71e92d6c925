//! Classification of SSH invocations into git protocol commands.

use std::fmt;

use crate::auth::AccessLevel;

/// Every command verb dispatched by the gateway shares this prefix.
pub const GIT_PREFIX: &str = "git";

/// The git transport commands recognised over SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitCommand {
    UploadPack,
    ReceivePack,
    UploadArchive,
    Other,
}

impl GitCommand {
    /// Map a command verb (`argv[0]`) onto its variant.
    pub fn classify(verb: &str) -> Self {
        match verb {
            "git-upload-pack" => GitCommand::UploadPack,
            "git-receive-pack" => GitCommand::ReceivePack,
            "git-upload-archive" => GitCommand::UploadArchive,
            _ => GitCommand::Other,
        }
    }

    /// Minimum access level required to run the command.
    pub fn required_access(&self) -> AccessLevel {
        match self {
            GitCommand::ReceivePack => AccessLevel::ReadWrite,
            GitCommand::UploadPack | GitCommand::UploadArchive => AccessLevel::ReadOnly,
            GitCommand::Other => AccessLevel::Admin,
        }
    }

    /// The `git` subcommand that serves this command.
    pub fn subcommand(&self) -> Option<&'static str> {
        match self {
            GitCommand::UploadPack => Some("upload-pack"),
            GitCommand::ReceivePack => Some("receive-pack"),
            GitCommand::UploadArchive => Some("upload-archive"),
            GitCommand::Other => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GitCommand::UploadPack => "git-upload-pack",
            GitCommand::ReceivePack => "git-receive-pack",
            GitCommand::UploadArchive => "git-upload-archive",
            GitCommand::Other => "other",
        }
    }
}

impl fmt::Display for GitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A git protocol invocation extracted from a session's argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation<'a> {
    pub command: GitCommand,
    /// Repository token exactly as the client sent it.
    pub repo: &'a str,
}

impl<'a> Invocation<'a> {
    /// Returns `None` when the arguments are not a dispatchable git command:
    /// fewer than two arguments, a verb without the `git` prefix, or an
    /// unrecognised `git*` verb.
    pub fn parse(args: &'a [String]) -> Option<Self> {
        let [verb, repo, ..] = args else {
            return None;
        };
        if !verb.starts_with(GIT_PREFIX) {
            return None;
        }
        match GitCommand::classify(verb) {
            GitCommand::Other => None,
            command => Some(Self {
                command,
                repo: repo.as_str(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classify_known_verbs() {
        assert_eq!(GitCommand::classify("git-upload-pack"), GitCommand::UploadPack);
        assert_eq!(GitCommand::classify("git-receive-pack"), GitCommand::ReceivePack);
        assert_eq!(GitCommand::classify("git-upload-archive"), GitCommand::UploadArchive);
        assert_eq!(GitCommand::classify("git-lfs-authenticate"), GitCommand::Other);
        assert_eq!(GitCommand::classify("ls"), GitCommand::Other);
    }

    #[test]
    fn thresholds() {
        assert_eq!(GitCommand::ReceivePack.required_access(), AccessLevel::ReadWrite);
        assert_eq!(GitCommand::UploadPack.required_access(), AccessLevel::ReadOnly);
        assert_eq!(GitCommand::UploadArchive.required_access(), AccessLevel::ReadOnly);
    }

    #[test]
    fn parse_upload_pack() {
        let a = args(&["git-upload-pack", "acme/widgets.git"]);
        let inv = Invocation::parse(&a).unwrap();
        assert_eq!(inv.command, GitCommand::UploadPack);
        assert_eq!(inv.repo, "acme/widgets.git");
    }

    #[test]
    fn parse_requires_two_arguments() {
        assert!(Invocation::parse(&args(&["git-upload-pack"])).is_none());
        assert!(Invocation::parse(&args(&[])).is_none());
    }

    #[test]
    fn parse_ignores_other_commands() {
        assert!(Invocation::parse(&args(&["repo", "create", "x"])).is_none());
        assert!(Invocation::parse(&args(&["git-lfs-authenticate", "x", "download"])).is_none());
    }

    #[test]
    fn parse_keeps_extra_arguments_out_of_repo() {
        let a = args(&["git-upload-archive", "r.git", "--extra"]);
        assert_eq!(Invocation::parse(&a).unwrap().repo, "r.git");
    }
}
