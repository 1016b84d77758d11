use super::{emit, image_matches_pattern, Authenticator, AuthenticationSourceRef, AuthenticationToken};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// Final authenticator in the chain: a single anonymous attempt, suppressed
/// for registries configured as private.
pub struct AnonymousAuthenticator {
    private_registry_patterns: Vec<String>,
}

impl AnonymousAuthenticator {
    pub fn new(private_registry_patterns: Vec<String>) -> Self {
        Self {
            private_registry_patterns,
        }
    }
}

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(
        &self,
        _image_pull_secret: &str,
        registry: &str,
        image: &str,
        _tag: &str,
        candidates: &mpsc::Sender<AuthenticationToken>,
    ) {
        for pattern in &self.private_registry_patterns {
            if image_matches_pattern(registry, image, pattern) {
                debug!(
                    registry = registry,
                    image = image,
                    pattern = pattern.as_str(),
                    "registry is private, skipping anonymous attempt"
                );
                return;
            }
        }
        emit(
            candidates,
            AuthenticationToken {
                kind: String::new(),
                token: String::new(),
                source: AuthenticationSourceRef {
                    provider: "anonymous".to_string(),
                },
            },
        )
        .await;
    }
}
