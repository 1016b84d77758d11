//! Docker config credentials: inline secrets, host files, credential stores

use super::{emit, Authenticator, AuthenticationToken, DockerConfig};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Response from a `docker-credential-<store>` helper
#[derive(Deserialize)]
struct CredentialStoreResponse {
    #[serde(rename = "Username", default)]
    username: String,
    #[serde(rename = "Secret", default)]
    secret: String,
}

/// Executes `docker-credential-<store> get` with the registry on stdin and
/// returns the encoded `username:password` pair.
async fn exec_credential_store(store: &str, registry: &str) -> Option<String> {
    let registry = if registry == "docker.io" {
        "index.docker.io"
    } else {
        registry
    };
    let helper = format!("docker-credential-{}", store);
    let mut child = match Command::new(&helper)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            debug!(helper = helper.as_str(), error = %err, "failed to spawn credential store helper");
            return None;
        }
    };
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(err) = stdin.write_all(registry.as_bytes()).await {
            debug!(helper = helper.as_str(), error = %err, "failed to write to credential store helper");
            return None;
        }
    }
    let output = match child.wait_with_output().await {
        Ok(output) => output,
        Err(err) => {
            debug!(helper = helper.as_str(), error = %err, "failed to run credential store helper");
            return None;
        }
    };
    if !output.status.success() {
        debug!(
            helper = helper.as_str(),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "credential store helper failed"
        );
        return None;
    }
    let response: CredentialStoreResponse = match serde_json::from_slice(&output.stdout) {
        Ok(response) => response,
        Err(err) => {
            debug!(helper = helper.as_str(), error = %err, "failed to parse credential store helper response");
            return None;
        }
    };
    Some(
        base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", response.username, response.secret)),
    )
}

fn auths_key_matches(key: &str, registry: &str, image: &str) -> bool {
    key == registry
        || super::wildcard_match(key, &format!("{}/{}", registry, image), &['/'])
}

/// Emits every credential of a docker config matching the image: the
/// credential store first when configured, then each matching `auths` entry.
pub(crate) async fn emit_docker_config_candidates(
    cfg: &DockerConfig,
    registry: &str,
    image: &str,
    provider: &str,
    candidates: &mpsc::Sender<AuthenticationToken>,
) {
    if !cfg.creds_store.is_empty() {
        if let Some(token) = exec_credential_store(&cfg.creds_store, registry).await {
            if !emit(candidates, AuthenticationToken::basic(token, provider)).await {
                return;
            }
        }
    }
    for (key, auth) in &cfg.auths {
        let key = if key == "https://index.docker.io/v1/" {
            "docker.io"
        } else {
            key.as_str()
        };
        if auths_key_matches(key, registry, image) && !auth.auth.is_empty() {
            debug!(
                registry = key,
                image = format!("{}/{}", registry, image).as_str(),
                "image matches registry config, trying it"
            );
            if !emit(
                candidates,
                AuthenticationToken::basic(auth.auth.clone(), provider),
            )
            .await
            {
                return;
            }
        }
    }
}

/// The ordered list of docker config locations probed on the host.
pub fn default_config_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("/var/lib/kubelet/config.json")];
    if let Ok(docker_config) = std::env::var("DOCKER_CONFIG") {
        candidates.push(PathBuf::from(docker_config).join("config.json"));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".docker/config.json"));
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".docker/config.json"));
    }
    candidates.push(PathBuf::from("/.docker/config.json"));
    candidates.push(PathBuf::from("/var/lib/kubelet/.dockercfg"));
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".dockercfg"));
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".dockercfg"));
    }
    candidates.push(PathBuf::from("/.dockercfg"));
    candidates
}

/// Authenticates from the first readable docker config file on the host.
pub struct DockerConfigFileAuthenticator {
    candidates: Vec<PathBuf>,
}

impl DockerConfigFileAuthenticator {
    pub fn new() -> Self {
        Self {
            candidates: default_config_candidates(),
        }
    }

    pub fn with_candidates(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }

    fn read_docker_config(&self) -> DockerConfig {
        for candidate in &self.candidates {
            let content = match std::fs::read_to_string(candidate) {
                Ok(content) => content,
                Err(_) => continue,
            };
            let cfg: DockerConfig = match serde_json::from_str(&content) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!(
                        candidate = %candidate.display(),
                        error = %err,
                        "failed to parse docker config"
                    );
                    continue;
                }
            };
            for registry in cfg.auths.keys() {
                debug!(
                    registry = registry.as_str(),
                    candidate = %candidate.display(),
                    "loaded registry auth config"
                );
            }
            return cfg;
        }
        DockerConfig::default()
    }
}

impl Default for DockerConfigFileAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authenticator for DockerConfigFileAuthenticator {
    async fn authenticate(
        &self,
        _image_pull_secret: &str,
        registry: &str,
        image: &str,
        _tag: &str,
        candidates: &mpsc::Sender<AuthenticationToken>,
    ) {
        let cfg = self.read_docker_config();
        emit_docker_config_candidates(&cfg, registry, image, "dockerConfigFile", candidates).await;
    }
}
