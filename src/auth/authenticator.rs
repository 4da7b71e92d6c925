use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::{AccessLevel, Credential};
use crate::backend::Backend;
use crate::metrics::Recorder;

/// Decides whether an SSH connection may authenticate.
///
/// Both decisions are infallible: a backend error denies the attempt.
pub struct Authenticator {
    admin_keys: HashSet<Credential>,
    backend: Arc<dyn Backend>,
    recorder: Arc<dyn Recorder>,
}

impl Authenticator {
    pub fn new(
        admin_keys: impl IntoIterator<Item = Credential>,
        backend: Arc<dyn Backend>,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        Self {
            admin_keys: admin_keys.into_iter().collect(),
            backend,
            recorder,
        }
    }

    pub fn is_admin(&self, credential: &Credential) -> bool {
        self.admin_keys.contains(credential)
    }

    /// Public-key decision.  `None` is a connection that offered no key and
    /// falls back to the backend's keyless policy.
    #[instrument(skip(self, credential), fields(fingerprint = tracing::field::Empty))]
    pub async fn public_key(&self, user: &str, credential: Option<&Credential>) -> bool {
        let Some(credential) = credential else {
            let allowed = self.backend.allow_keyless().await;
            debug!(allowed, "keyless authentication");
            return allowed;
        };
        tracing::Span::current().record("fingerprint", credential.fingerprint().as_str());

        let allowed = if self.is_admin(credential) {
            debug!("bootstrap administrator key");
            true
        } else {
            match self.backend.access_level("", Some(credential)).await {
                Ok(level) => level >= AccessLevel::ReadOnly,
                Err(e) => {
                    warn!(error = %e, "access lookup failed; denying");
                    false
                }
            }
        };

        self.recorder
            .public_key_auth(&credential.encoding(), user, allowed);
        debug!(allowed, "public key authentication");
        allowed
    }

    /// Keyboard-interactive decision.  The responses are never inspected;
    /// the outcome is the backend's keyless policy.
    #[instrument(skip(self))]
    pub async fn keyboard_interactive(&self, user: &str) -> bool {
        let allowed = self.backend.allow_keyless().await;
        self.recorder.keyboard_interactive_auth(user, allowed);
        debug!(allowed, "keyboard-interactive authentication");
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credential::tests::{alice, bob};
    use crate::backend::testing::FakeBackend;
    use crate::metrics::{KeyboardInteractiveLabels, MetricsRegistry, PublicKeyAuthLabels};

    fn authenticator(backend: FakeBackend, registry: &MetricsRegistry) -> Authenticator {
        Authenticator::new([alice()], Arc::new(backend), registry.metrics.clone())
    }

    fn pk_count(registry: &MetricsRegistry, cred: &Credential, user: &str, allowed: bool) -> u64 {
        registry
            .metrics
            .public_key_auth_total
            .get_or_create(&PublicKeyAuthLabels {
                key: cred.encoding(),
                user: user.to_string(),
                allowed: allowed.to_string(),
            })
            .get()
    }

    #[tokio::test]
    async fn admin_key_bypasses_backend() {
        let registry = MetricsRegistry::new();
        let backend = FakeBackend {
            fail_lookup: true,
            ..Default::default()
        };
        let auth = authenticator(backend, &registry);
        assert!(auth.public_key("root", Some(&alice())).await);
        assert_eq!(pk_count(&registry, &alice(), "root", true), 1);
    }

    #[tokio::test]
    async fn admin_key_allowed_even_when_backend_denies() {
        let registry = MetricsRegistry::new();
        let auth = authenticator(FakeBackend::default(), &registry);
        assert!(auth.public_key("root", Some(&alice())).await);
    }

    #[tokio::test]
    async fn global_read_access_admits_key() {
        let registry = MetricsRegistry::new();
        let backend = FakeBackend::default().with_level("", AccessLevel::ReadOnly);
        let auth = authenticator(backend, &registry);
        assert!(auth.public_key("bob", Some(&bob())).await);
        assert_eq!(pk_count(&registry, &bob(), "bob", true), 1);
    }

    #[tokio::test]
    async fn no_access_denies_and_records() {
        let registry = MetricsRegistry::new();
        let auth = authenticator(FakeBackend::default(), &registry);
        assert!(!auth.public_key("bob", Some(&bob())).await);
        assert_eq!(pk_count(&registry, &bob(), "bob", false), 1);
        assert_eq!(pk_count(&registry, &bob(), "bob", true), 0);
    }

    #[tokio::test]
    async fn backend_error_fails_closed() {
        let registry = MetricsRegistry::new();
        let backend = FakeBackend {
            fail_lookup: true,
            ..Default::default()
        }
        .with_level("", AccessLevel::Admin);
        let auth = authenticator(backend, &registry);
        assert!(!auth.public_key("bob", Some(&bob())).await);
    }

    #[tokio::test]
    async fn keyless_denied_when_policy_forbids() {
        let registry = MetricsRegistry::new();
        let auth = authenticator(FakeBackend::default(), &registry);
        assert!(!auth.public_key("anon", None).await);
        assert!(!auth.keyboard_interactive("anon").await);

        let encoded = registry.encode().unwrap();
        assert!(!encoded.contains("allowed=\"true\""));
        let kbi_allowed = registry
            .metrics
            .keyboard_interactive_auth_total
            .get_or_create(&KeyboardInteractiveLabels {
                user: "anon".into(),
                allowed: "true".into(),
            })
            .get();
        assert_eq!(kbi_allowed, 0);
    }

    #[tokio::test]
    async fn keyboard_interactive_follows_keyless_policy() {
        let registry = MetricsRegistry::new();
        let backend = FakeBackend {
            allow_keyless: true,
            ..Default::default()
        };
        let auth = authenticator(backend, &registry);
        assert!(auth.keyboard_interactive("anyone").await);
        assert!(auth.public_key("anyone", None).await);
    }
}
