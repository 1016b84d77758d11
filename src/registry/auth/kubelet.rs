//! Kubelet credential provider protocol
//!
//! Providers are external binaries receiving a serialised
//! `CredentialProviderRequest` on stdin and answering with a
//! `CredentialProviderResponse` on stdout, as configured by the kubelet's
//! credential provider config file.

use super::{emit, image_matches_pattern, Authenticator, AuthenticationToken};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const SUPPORTED_API_VERSIONS: [&str; 3] = [
    "credentialprovider.kubelet.k8s.io/v1",
    "credentialprovider.kubelet.k8s.io/v1beta1",
    "credentialprovider.kubelet.k8s.io/v1alpha1",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialProviderConfig {
    #[serde(default)]
    providers: Vec<CredentialProvider>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialProvider {
    name: String,
    #[serde(default)]
    match_images: Vec<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<ExecEnvVar>,
    #[serde(default)]
    api_version: String,
}

#[derive(Debug, Deserialize)]
struct ExecEnvVar {
    name: String,
    value: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialProviderRequest<'a> {
    kind: &'a str,
    api_version: &'a str,
    image: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialProviderResponse {
    #[serde(default)]
    auth: BTreeMap<String, ProviderAuthConfig>,
}

#[derive(Debug, Deserialize)]
struct ProviderAuthConfig {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// Authenticates by executing kubelet credential provider plugins.
pub struct KubeletAuthenticator {
    bin_dir: PathBuf,
    config: PathBuf,
}

impl KubeletAuthenticator {
    pub fn new(bin_dir: &str, config: &str) -> Self {
        Self {
            bin_dir: PathBuf::from(bin_dir),
            config: PathBuf::from(config),
        }
    }

    fn provider_matches_image(provider: &CredentialProvider, registry: &str, image: &str) -> bool {
        provider
            .match_images
            .iter()
            .any(|pattern| image_matches_pattern(registry, image, pattern))
    }

    async fn try_provider(
        &self,
        provider: &CredentialProvider,
        registry: &str,
        image: &str,
        candidates: &mpsc::Sender<AuthenticationToken>,
    ) {
        if !SUPPORTED_API_VERSIONS.contains(&provider.api_version.as_str()) {
            error!(
                provider = provider.name.as_str(),
                api_version = provider.api_version.as_str(),
                "unsupported credential provider apiVersion, skipping it"
            );
            return;
        }
        let full_image = format!("{}/{}", registry, image.trim_start_matches('/'));
        let request = CredentialProviderRequest {
            kind: "CredentialProviderRequest",
            api_version: &provider.api_version,
            image: &full_image,
        };
        let stdin_payload = match serde_json::to_vec(&request) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "could not serialize credential provider request, skipping it");
                return;
            }
        };

        let mut command = Command::new(self.bin_dir.join(&provider.name));
        command
            .args(&provider.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for env in &provider.env {
            command.env(&env.name, &env.value);
        }
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(
                    provider = provider.name.as_str(),
                    error = %err,
                    "could not execute credential provider, skipping it"
                );
                return;
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(&stdin_payload).await {
                error!(error = %err, "could not write credential provider request, skipping it");
                return;
            }
        }
        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(err) => {
                error!(
                    provider = provider.name.as_str(),
                    error = %err,
                    "could not execute credential provider, skipping it"
                );
                return;
            }
        };
        if !output.status.success() || !output.stderr.is_empty() {
            warn!(
                provider = provider.name.as_str(),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "credential provider reported an error, skipping it"
            );
            return;
        }
        let response: CredentialProviderResponse = match serde_json::from_slice(&output.stdout) {
            Ok(response) => response,
            Err(err) => {
                error!(
                    provider = provider.name.as_str(),
                    error = %err,
                    "could not parse credential provider response, skipping it"
                );
                return;
            }
        };
        for (key, auth) in &response.auth {
            if image_matches_pattern(registry, image, key) {
                debug!(matching_image = key.as_str(), "matched credential provider response");
                let token = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", auth.username, auth.password));
                if !emit(candidates, AuthenticationToken::basic(token, "kubelet")).await {
                    return;
                }
            } else {
                info!(
                    matching_image = key.as_str(),
                    "image does not match credential provider response, skipping it"
                );
            }
        }
    }
}

#[async_trait]
impl Authenticator for KubeletAuthenticator {
    async fn authenticate(
        &self,
        _image_pull_secret: &str,
        registry: &str,
        image: &str,
        _tag: &str,
        candidates: &mpsc::Sender<AuthenticationToken>,
    ) {
        if self.config.as_os_str().is_empty() || self.bin_dir.as_os_str().is_empty() {
            debug!("credential provider config or bin dir not set, skipping kubelet credentials");
            return;
        }
        let data = match std::fs::read_to_string(&self.config) {
            Ok(data) => data,
            Err(err) => {
                error!(
                    config = %self.config.display(),
                    error = %err,
                    "could not open credential provider config, skipping it"
                );
                return;
            }
        };
        let config: CredentialProviderConfig = match serde_yaml::from_str(&data) {
            Ok(config) => config,
            Err(err) => {
                error!(
                    config = %self.config.display(),
                    error = %err,
                    "could not decode credential provider config, skipping it"
                );
                return;
            }
        };
        for provider in &config.providers {
            if Self::provider_matches_image(provider, registry, image) {
                info!(provider = provider.name.as_str(), "matched credential provider");
                self.try_provider(provider, registry, image, candidates).await;
            } else {
                info!(
                    provider = provider.name.as_str(),
                    "image does not match credential provider config, skipping it"
                );
            }
        }
    }
}
