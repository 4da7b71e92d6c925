//! Authentication and authorisation subsystem.
//!
//! Maps SSH public keys to a canonical [`Credential`], defines the ordered
//! [`AccessLevel`] model and decides whether a connection may authenticate.

pub mod access;
pub mod authenticator;
pub mod credential;

pub use access::AccessLevel;
pub use authenticator::Authenticator;
pub use credential::Credential;
