//! Canonical encoding of SSH public keys.
//!
//! A [`Credential`] is rendered in `authorized_keys` form without options or
//! comment (`<key-type> <base64-blob>`).  The key type is read from the blob
//! itself rather than from the signature algorithm the client negotiated, so
//! an RSA key offered with `rsa-sha2-512` encodes identically to the same key
//! listed as `ssh-rsa` in the configuration.

use std::fmt;

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    key_type: String,
    blob: String,
}

impl Credential {
    /// Build the credential for a key presented during authentication.
    pub fn from_public_key(key: &PublicKey) -> Result<Self> {
        let blob = key.public_key_base64();
        let key_type = key_type_of(&blob)?;
        Ok(Self { key_type, blob })
    }

    /// Parse an `authorized_keys` style line: `<type> <base64> [comment]`.
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let (Some(declared), Some(blob)) = (fields.next(), fields.next()) else {
            bail!("public key must have the form '<type> <base64>'");
        };
        let key_type = key_type_of(blob)?;
        if key_type != declared {
            bail!("public key type {declared:?} does not match encoded type {key_type:?}");
        }
        Ok(Self {
            key_type,
            blob: blob.to_string(),
        })
    }

    /// Stable text encoding used as map key, log field and metric label.
    pub fn encoding(&self) -> String {
        format!("{} {}", self.key_type, self.blob)
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// SHA-256 fingerprint in `ssh-keygen -l` format (`SHA256:<b64>`).
    pub fn fingerprint(&self) -> String {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(self.blob.as_bytes())
            .unwrap_or_default();
        let hash = Sha256::digest(&raw);
        let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
        format!("SHA256:{encoded}")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key_type, self.blob)
    }
}

/// Read the leading SSH `string` (u32 big-endian length + bytes) of a key
/// blob, which names the key type.
fn key_type_of(blob_b64: &str) -> Result<String> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(blob_b64.as_bytes())
        .context("public key blob is not valid base64")?;
    let Some(len_bytes) = raw.get(..4) else {
        bail!("public key blob is truncated");
    };
    let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    let Some(name) = raw.get(4..4 + len) else {
        bail!("public key blob is truncated");
    };
    if raw.len() == 4 + len {
        bail!("public key blob carries no key material");
    }
    let name = std::str::from_utf8(name).context("public key type is not valid UTF-8")?;
    Ok(name.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const ALICE_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMJwhFepXI/xg/gHwN7WIHmjIKMJoBJd/3tl0+SZw6oU alice@example";
    pub const BOB_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIE2IKtMbn2piBdiKNFhpsEnsn9bFHU9SQYbDJchnpdxS bob";
    pub const CAROL_KEY: &str = "ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBCeTAoZlaSPqv24GJckjYLuXKfYaoePSJRgtVbjq1NivI2Q5k5LMxkzQnt0e2EFtw74P45W5t14VLUWHGbp6am0= carol";

    pub fn alice() -> Credential {
        Credential::parse(ALICE_KEY).unwrap()
    }

    pub fn bob() -> Credential {
        Credential::parse(BOB_KEY).unwrap()
    }

    #[test]
    fn parse_strips_comment() {
        let cred = alice();
        assert_eq!(
            cred.encoding(),
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMJwhFepXI/xg/gHwN7WIHmjIKMJoBJd/3tl0+SZw6oU"
        );
        assert_eq!(cred.key_type(), "ssh-ed25519");
    }

    #[test]
    fn parse_ecdsa() {
        let cred = Credential::parse(CAROL_KEY).unwrap();
        assert_eq!(cred.key_type(), "ecdsa-sha2-nistp256");
    }

    #[test]
    fn encoding_is_deterministic_and_distinct() {
        assert_eq!(alice().encoding(), alice().encoding());
        assert_ne!(alice().encoding(), bob().encoding());
        assert_eq!(alice(), Credential::parse(&alice().encoding()).unwrap());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Credential::parse("").is_err());
        assert!(Credential::parse("ssh-ed25519").is_err());
        assert!(Credential::parse("ssh-ed25519 not-base64!!").is_err());
        assert!(Credential::parse("ssh-ed25519 AAAA").is_err());
    }

    #[test]
    fn parse_rejects_mismatched_type() {
        let blob = ALICE_KEY.split_whitespace().nth(1).unwrap();
        assert!(Credential::parse(&format!("ssh-rsa {blob}")).is_err());
    }

    #[test]
    fn fingerprint_has_sha256_prefix() {
        let fp = alice().fingerprint();
        assert!(fp.starts_with("SHA256:"));
        assert_ne!(fp, bob().fingerprint());
    }
}
