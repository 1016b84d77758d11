use super::docker_config::emit_docker_config_candidates;
use super::{Authenticator, AuthenticationToken, DockerConfig};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::error;

/// Authenticates from the workload's inlined docker-config JSON.
pub struct ImagePullSecretAuthenticator;

#[async_trait]
impl Authenticator for ImagePullSecretAuthenticator {
    async fn authenticate(
        &self,
        image_pull_secret: &str,
        registry: &str,
        image: &str,
        _tag: &str,
        candidates: &mpsc::Sender<AuthenticationToken>,
    ) {
        if image_pull_secret.is_empty() {
            return;
        }
        let cfg: DockerConfig = match serde_json::from_str(image_pull_secret) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(error = %err, "failed to decode imagePullSecret");
                return;
            }
        };
        emit_docker_config_candidates(&cfg, registry, image, "imagePullSecret", candidates).await;
    }
}
