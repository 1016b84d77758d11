//! Credential resolution for container registries
//!
//! Authenticators produce candidate tokens for a `(registry, image)` pair on
//! a channel; the registry client consumes them lazily and hangs up as soon
//! as one candidate yields a usable platform list. Producers observe the
//! hang-up through failed sends, so every emit is a cancellation point.
//! Authenticators never fail; they simply emit fewer candidates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

mod anonymous;
mod containerd;
mod docker_config;
mod kubelet;
mod pull_secret;

pub use anonymous::AnonymousAuthenticator;
pub use containerd::ContainerdAuthenticator;
pub use docker_config::{default_config_candidates, DockerConfigFileAuthenticator};
pub use kubelet::KubeletAuthenticator;
pub use pull_secret::ImagePullSecretAuthenticator;

/// Names the authenticator that produced a token, for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticationSourceRef {
    pub provider: String,
}

/// A candidate credential. An empty token represents an anonymous attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticationToken {
    pub kind: String,
    pub token: String,
    pub source: AuthenticationSourceRef,
}

impl AuthenticationToken {
    pub fn basic(token: String, provider: &str) -> Self {
        Self {
            kind: "Basic".to_string(),
            token,
            source: AuthenticationSourceRef {
                provider: provider.to_string(),
            },
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Writes zero or more candidate tokens for the image to the channel.
    /// Implementations must stop as soon as a send fails: the consumer has
    /// found a winner and hung up.
    async fn authenticate(
        &self,
        image_pull_secret: &str,
        registry: &str,
        image: &str,
        tag: &str,
        candidates: &mpsc::Sender<AuthenticationToken>,
    );
}

/// Sends a candidate, reporting whether the consumer is still listening.
pub(crate) async fn emit(
    candidates: &mpsc::Sender<AuthenticationToken>,
    token: AuthenticationToken,
) -> bool {
    candidates.send(token).await.is_ok()
}

/// Ordered fan-out across the standard credential sources.
pub struct AuthenticatorChain {
    authenticators: Vec<Arc<dyn Authenticator>>,
}

/// Settings for the standard chain, parsed by the CLI layer.
#[derive(Debug, Clone, Default)]
pub struct ChainConfig {
    pub credential_provider_bin_dir: String,
    pub credential_provider_config: String,
    pub containerd_config_dir: String,
    pub private_registry_patterns: Vec<String>,
}

impl AuthenticatorChain {
    pub fn new(authenticators: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { authenticators }
    }

    /// The standard order: workload pull secret, kubelet credential provider,
    /// containerd host files, host docker config, anonymous.
    pub fn standard(config: ChainConfig) -> Self {
        Self::new(vec![
            Arc::new(ImagePullSecretAuthenticator),
            Arc::new(KubeletAuthenticator::new(
                &config.credential_provider_bin_dir,
                &config.credential_provider_config,
            )),
            Arc::new(ContainerdAuthenticator::new(&config.containerd_config_dir)),
            Arc::new(DockerConfigFileAuthenticator::new()),
            Arc::new(AnonymousAuthenticator::new(
                config.private_registry_patterns,
            )),
        ])
    }
}

#[async_trait]
impl Authenticator for AuthenticatorChain {
    async fn authenticate(
        &self,
        image_pull_secret: &str,
        registry: &str,
        image: &str,
        tag: &str,
        candidates: &mpsc::Sender<AuthenticationToken>,
    ) {
        for authenticator in &self.authenticators {
            if candidates.is_closed() {
                return;
            }
            authenticator
                .authenticate(image_pull_secret, registry, image, tag, candidates)
                .await;
        }
    }
}

/// Docker config file structure, as found in pull secrets and on hosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: BTreeMap<String, DockerAuth>,
    #[serde(rename = "credsStore", default, skip_serializing_if = "String::is_empty")]
    pub creds_store: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerAuth {
    #[serde(default)]
    pub auth: String,
}

/// Matches a glob pattern where `*` and `?` never cross any of the excluded
/// characters.
pub(crate) fn wildcard_match(pattern: &str, name: &str, excluded: &[char]) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && ((p[pi] == '?' && !excluded.contains(&n[ni])) || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((star_pi, star_ni)) = star {
            if excluded.contains(&n[star_ni]) {
                return false;
            }
            star = Some((star_pi, star_ni + 1));
            pi = star_pi + 1;
            ni = star_ni + 1;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Matches a registry host against a glob pattern where each `*` spans a
/// single domain segment, and both sides must have the same number of
/// segments. A bare `*` can only stand in for a subdomain, never the
/// registrable domain itself: `*.k8s.io` matches `app.k8s.io`, while `*.io`
/// matches neither `k8s.io` nor `app.k8s.io`.
pub(crate) fn host_glob_match(pattern: &str, host: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let host_segments: Vec<&str> = host.split('.').collect();
    if pattern_segments.len() != host_segments.len() {
        return false;
    }
    if pattern_segments.first() == Some(&"*") && pattern_segments.len() < 3 {
        return false;
    }
    pattern_segments
        .iter()
        .zip(host_segments)
        .all(|(pattern, segment)| wildcard_match(pattern, segment, &[]))
}

/// Matches an image against a `matchImages`-style pattern: an optional
/// `:port` pinning the registry port exactly, a host matched with
/// single-segment globs, and an optional path that must be a prefix of the
/// image path. Globs are not accepted in the port or the path.
pub fn image_matches_pattern(registry: &str, image: &str, pattern: &str) -> bool {
    let (match_reg, match_path) = match pattern.split_once('/') {
        Some((registry, path)) => (registry, path),
        None => (pattern, ""),
    };
    let (match_host, match_port) = match match_reg.split_once(':') {
        Some((host, port)) => (host, port),
        None => (match_reg, ""),
    };
    let (registry_host, registry_port) = match registry.split_once(':') {
        Some((host, port)) => (host, port),
        None => (registry, ""),
    };
    if !host_glob_match(match_host, registry_host) {
        return false;
    }
    if !match_port.is_empty() && registry_port != match_port {
        return false;
    }
    if !match_path.is_empty() && !image.starts_with(match_path) {
        return false;
    }
    true
}
