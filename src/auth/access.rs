use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Permission tier a credential holds on a repository.
///
/// Variants are declared in ascending order so the derived `Ord` gives the
/// total order `NoAccess < ReadOnly < ReadWrite < Admin`; a level implies
/// every capability of the levels below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessLevel {
    NoAccess = 0,
    ReadOnly = 1,
    ReadWrite = 2,
    Admin = 3,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::NoAccess => "no-access",
            AccessLevel::ReadOnly => "read-only",
            AccessLevel::ReadWrite => "read-write",
            AccessLevel::Admin => "admin",
        }
    }
}

impl Default for AccessLevel {
    fn default() -> Self {
        AccessLevel::NoAccess
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown access level: {0:?}")]
pub struct ParseAccessLevelError(String);

impl FromStr for AccessLevel {
    type Err = ParseAccessLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(AccessLevel::Admin),
            "read-write" | "write" | "push" => Ok(AccessLevel::ReadWrite),
            "read-only" | "read" | "pull" => Ok(AccessLevel::ReadOnly),
            "no-access" | "none" => Ok(AccessLevel::NoAccess),
            other => Err(ParseAccessLevelError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_ordering() {
        assert!(AccessLevel::NoAccess < AccessLevel::ReadOnly);
        assert!(AccessLevel::ReadOnly < AccessLevel::ReadWrite);
        assert!(AccessLevel::ReadWrite < AccessLevel::Admin);
    }

    #[test]
    fn test_access_default() {
        assert_eq!(AccessLevel::default(), AccessLevel::NoAccess);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("admin".parse::<AccessLevel>().unwrap(), AccessLevel::Admin);
        assert_eq!("push".parse::<AccessLevel>().unwrap(), AccessLevel::ReadWrite);
        assert_eq!("Read-Only".parse::<AccessLevel>().unwrap(), AccessLevel::ReadOnly);
        assert_eq!("pull".parse::<AccessLevel>().unwrap(), AccessLevel::ReadOnly);
        assert_eq!("none".parse::<AccessLevel>().unwrap(), AccessLevel::NoAccess);
    }

    #[test]
    fn test_parse_unknown() {
        assert!("gibberish".parse::<AccessLevel>().is_err());
        assert!("".parse::<AccessLevel>().is_err());
    }

    #[test]
    fn test_serde_values() {
        assert_eq!(serde_json::to_string(&AccessLevel::NoAccess).unwrap(), "\"no-access\"");
        assert_eq!(serde_json::to_string(&AccessLevel::ReadWrite).unwrap(), "\"read-write\"");
        let parsed: AccessLevel = serde_json::from_str("\"read-only\"").unwrap();
        assert_eq!(parsed, AccessLevel::ReadOnly);
    }

    #[test]
    fn test_display_matches_serde() {
        for level in [
            AccessLevel::NoAccess,
            AccessLevel::ReadOnly,
            AccessLevel::ReadWrite,
            AccessLevel::Admin,
        ] {
            let json = serde_json::to_string(&level).unwrap();
            assert_eq!(json.trim_matches('"'), level.to_string());
        }
    }
}
