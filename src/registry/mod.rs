//! Container registry client
//!
//! Resolves the set of platforms supported by an image by walking OCI/Docker
//! manifests, trying each credential candidate produced by the authenticator
//! chain until one yields a usable answer.

use crate::cache::{Cache, CacheMetrics};
use crate::httputils::{HttpRequest, HttpResponse, Transport};
use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, ACCEPT, AUTHORIZATION};
use hyper::{Method, Request, StatusCode};
use prometheus::{GaugeVec, IntCounter, IntCounterVec, Opts};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod auth;
pub mod cached;
pub mod www_authenticate;

use auth::{Authenticator, AuthenticationToken};
use www_authenticate::WwwAuthenticateTransport;

const MANIFEST_LIST_MEDIA_TYPES: [&str; 2] = [
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.index.v1+json",
];
const MANIFEST_MEDIA_TYPES: [&str; 2] = [
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
];

/// An (os, architecture, variant) tuple as reported by a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub variant: String,
}

impl Platform {
    pub fn new(architecture: &str, os: &str) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            variant: String::new(),
        }
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn list_archs(&self, image_pull_secret: &str, image: &str) -> Result<Vec<Platform>>;
}

/// Registry implementation for a plain function, mostly useful in tests.
pub struct RegistryFunc<F>(pub F);

#[async_trait]
impl<F> Registry for RegistryFunc<F>
where
    F: Fn(&str, &str) -> Result<Vec<Platform>> + Send + Sync,
{
    async fn list_archs(&self, image_pull_secret: &str, image: &str) -> Result<Vec<Platform>> {
        (self.0)(image_pull_secret, image)
    }
}

/// Rewrites a registry host to a corporate proxy. First match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryProxy {
    pub registry: String,
    pub proxy: String,
}

/// Parses `docker.io=proxy.corp,quay.io=quay.corp` flag syntax; invalid
/// entries are logged and dropped.
pub fn parse_registry_proxies(proxies: &str) -> Vec<RegistryProxy> {
    let mut parsed = Vec::new();
    for proxy in proxies.split(',') {
        let proxy = proxy.trim();
        if proxy.is_empty() {
            continue;
        }
        match proxy.split_once('=') {
            Some((registry, proxy_host)) => parsed.push(RegistryProxy {
                registry: registry.to_string(),
                proxy: proxy_host.to_string(),
            }),
            None => {
                warn!(registry_proxy = proxy, "invalid registry proxy syntax, ignoring");
            }
        }
    }
    parsed
}

#[derive(Debug, Deserialize)]
struct RegistryManifestListResponse {
    // for application/vnd.docker.distribution.manifest.v2+json
    #[serde(default)]
    architecture: String,
    // for application/vnd.docker.distribution.manifest.list.v2+json
    #[serde(default)]
    manifests: Vec<RegistryManifestRef>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryManifestRef {
    #[serde(default)]
    platform: Platform,
    #[serde(default)]
    digest: String,
}

pub struct RegistryMetrics {
    pub requests: IntCounter,
    pub responses: IntCounterVec,
    pub errors: IntCounterVec,
    pub rate_limit_remaining: GaugeVec,
    pub rate_limit_limit: GaugeVec,
    pub rate_limit_window: GaugeVec,
}

impl RegistryMetrics {
    pub fn new(prefix: &str, registry: &prometheus::Registry) -> Result<Self> {
        let requests = IntCounter::with_opts(
            Opts::new(
                "requests_total",
                "Number of requests to the container image registry",
            )
            .namespace(prefix)
            .subsystem("registry"),
        )?;
        let responses = IntCounterVec::new(
            Opts::new(
                "responses_total",
                "Number of request responses from the container image registry",
            )
            .namespace(prefix)
            .subsystem("registry"),
            &["kind", "http_status"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new(
                "errors_total",
                "Number of errors requesting the container image registry",
            )
            .namespace(prefix)
            .subsystem("registry"),
            &["errors"],
        )?;
        let rate_limit_remaining = GaugeVec::new(
            Opts::new("rate_limit_remaining", "Number of requests remaining")
                .namespace(prefix)
                .subsystem("registry"),
            &["registry"],
        )?;
        let rate_limit_limit = GaugeVec::new(
            Opts::new("rate_limit_limit", "Total number of requests allowed")
                .namespace(prefix)
                .subsystem("registry"),
            &["registry"],
        )?;
        let rate_limit_window = GaugeVec::new(
            Opts::new(
                "rate_limit_window_seconds",
                "The window in seconds for the rate limit",
            )
            .namespace(prefix)
            .subsystem("registry"),
            &["registry"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(responses.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(rate_limit_remaining.clone()))?;
        registry.register(Box::new(rate_limit_limit.clone()))?;
        registry.register(Box::new(rate_limit_window.clone()))?;
        Ok(Self {
            requests,
            responses,
            errors,
            rate_limit_remaining,
            rate_limit_limit,
            rate_limit_window,
        })
    }
}

fn manifest_kind_from_media_type(media_type: &str) -> &'static str {
    if MANIFEST_LIST_MEDIA_TYPES.contains(&media_type) {
        return "manifest_list";
    }
    if MANIFEST_MEDIA_TYPES.contains(&media_type) {
        return "manifest";
    }
    "unknown"
}

/// Rate limit headers use the docker hub format:
/// `RateLimit-Limit: 100;w=21600`, `RateLimit-Remaining: 83;w=21600`.
fn rate_limit_headers(resp: &HttpResponse) -> (String, String, String) {
    let header = |name: &str| {
        resp.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let remaining_raw = header("RateLimit-Remaining");
    let limit_raw = header("RateLimit-Limit");
    let split_window = |raw: &str| -> (String, String) {
        let mut parts = raw.splitn(2, ';');
        let value = parts.next().unwrap_or("").to_string();
        let window = parts
            .next()
            .and_then(|rest| rest.split_once('='))
            .map(|(_, window)| window.to_string())
            .unwrap_or_default();
        (value, window)
    };
    let (remaining, remaining_window) = split_window(&remaining_raw);
    let (limit, limit_window) = split_window(&limit_raw);
    let window = if remaining_window.is_empty() {
        limit_window
    } else {
        remaining_window
    };
    (remaining, limit, window)
}

/// Registry host, repository and tag parsed out of a user image string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedImage {
    pub registry: String,
    pub image: String,
    pub tag: String,
    pub has_digest: bool,
}

pub struct PlainRegistry {
    scheme: String,
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    proxies: Vec<RegistryProxy>,
    schedulable_architectures: Vec<String>,
    authenticate_cache: Arc<Cache<String>>,
    cache_metrics: Arc<CacheMetrics>,
    metrics: RegistryMetrics,
}

impl PlainRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        authenticator: Arc<dyn Authenticator>,
        registry: &prometheus::Registry,
    ) -> Result<Self> {
        Ok(Self {
            scheme: "https".to_string(),
            transport,
            authenticator,
            proxies: Vec::new(),
            schedulable_architectures: Vec::new(),
            authenticate_cache: Arc::new(Cache::new(Duration::ZERO)),
            cache_metrics: Arc::new(CacheMetrics::new(
                "noe",
                "registry_authentication",
                registry,
            )?),
            metrics: RegistryMetrics::new("noe", registry)?,
        })
    }

    pub fn with_proxies(mut self, proxies: Vec<RegistryProxy>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_schedulable_architectures(mut self, architectures: Vec<String>) -> Self {
        self.schedulable_architectures = architectures;
        self
    }

    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }

    /// Splits a user image string into registry, repository and tag. The
    /// first segment is treated as a registry host only when it contains `.`
    /// or `:` and more segments follow; bare Docker Hub references are
    /// normalised to `docker.io` with a `library/` repository prefix, and the
    /// first matching proxy rule rewrites the registry host.
    pub fn parse_image(&self, image: &str) -> ParsedImage {
        let mut registry = String::new();
        let mut rest = image;
        let mut has_digest = false;

        if let Some((first, remainder)) = rest.split_once('/') {
            if first.contains('.') || first.contains(':') {
                registry = first.to_string();
                rest = remainder;
            }
        }
        if let Some((name, _digest)) = rest.split_once('@') {
            rest = name;
            has_digest = true;
        }
        let (name, tag) = match rest.split_once(':') {
            Some((name, tag)) => (name, tag.to_string()),
            None => (rest, "latest".to_string()),
        };
        let mut image = name.to_string();
        if registry.is_empty() {
            registry = "docker.io".to_string();
        }
        if registry == "docker.io" && !image.contains('/') {
            image = format!("library/{}", image);
        }
        for proxy in &self.proxies {
            if auth::wildcard_match(&proxy.registry, &registry, &['/']) {
                debug!(
                    registry = registry.as_str(),
                    proxy = proxy.proxy.as_str(),
                    "using docker registry proxy"
                );
                registry = proxy.proxy.clone();
            }
        }
        ParsedImage {
            registry,
            image,
            tag,
            has_digest,
        }
    }

    fn is_arch_schedulable(&self, arch: &str) -> bool {
        self.schedulable_architectures.is_empty()
            || self.schedulable_architectures.iter().any(|a| a == arch)
    }

    async fn get_image_manifest(
        &self,
        transport: &Arc<dyn Transport>,
        auth: &AuthenticationToken,
        registry: &str,
        image: &str,
        reference: &str,
        accept: &[&str],
    ) -> Result<HttpResponse> {
        self.metrics.requests.inc();
        let uri = format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme, registry, image, reference
        );
        let mut req: HttpRequest = match Request::builder()
            .method(Method::GET)
            .uri(&uri)
            .body(Full::new(Bytes::new()))
        {
            Ok(req) => req,
            Err(err) => {
                self.metrics
                    .errors
                    .with_label_values(&["new_request_failed"])
                    .inc();
                return Err(err.into());
            }
        };
        for media_type in accept {
            req.headers_mut()
                .append(ACCEPT, HeaderValue::from_str(media_type)?);
        }
        if !auth.token.is_empty() {
            req.headers_mut().insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("{} {}", auth.kind, auth.token))?,
            );
        }
        let resp = match transport.round_trip(req).await {
            Ok(resp) => resp,
            Err(err) => {
                self.metrics
                    .errors
                    .with_label_values(&["request_failed"])
                    .inc();
                return Err(err);
            }
        };
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        self.metrics
            .responses
            .with_label_values(&[
                manifest_kind_from_media_type(content_type),
                resp.status().as_str(),
            ])
            .inc();
        Ok(resp)
    }

    fn update_remaining_rate_limits(&self, registry: &str, resp: &HttpResponse) {
        let (remaining, limit, window) = rate_limit_headers(resp);
        if !remaining.is_empty() {
            match remaining.parse::<f64>() {
                Ok(value) => self
                    .metrics
                    .rate_limit_remaining
                    .with_label_values(&[registry])
                    .set(value),
                Err(err) => warn!(error = %err, "failed to parse rate-limit remaining"),
            }
        }
        if !limit.is_empty() {
            match limit.parse::<f64>() {
                Ok(value) => self
                    .metrics
                    .rate_limit_limit
                    .with_label_values(&[registry])
                    .set(value),
                Err(err) => warn!(error = %err, "failed to parse rate-limit limit"),
            }
        }
        if !window.is_empty() {
            match window.parse::<f64>() {
                Ok(value) => self
                    .metrics
                    .rate_limit_window
                    .with_label_values(&[registry])
                    .set(value),
                Err(err) => warn!(error = %err, "failed to parse rate-limit window"),
            }
        }
    }

    /// Verifies a manifest-list descriptor is actually fetchable. A `404`
    /// skips the descriptor silently; any other non-OK status fails the
    /// attempt.
    async fn verify_manifest_ref(
        &self,
        transport: &Arc<dyn Transport>,
        auth: &AuthenticationToken,
        registry: &str,
        image: &str,
        manifest: &RegistryManifestRef,
    ) -> Result<Option<Platform>> {
        let resp = self
            .get_image_manifest(
                transport,
                auth,
                registry,
                image,
                &manifest.digest,
                &MANIFEST_MEDIA_TYPES,
            )
            .await?;
        self.update_remaining_rate_limits(registry, &resp);
        if resp.status() == StatusCode::OK {
            return Ok(Some(manifest.platform.clone()));
        }
        if resp.status() == StatusCode::NOT_FOUND {
            info!(
                arch = manifest.platform.architecture.as_str(),
                registry = registry,
                image = image,
                status = resp.status().as_u16(),
                "skipping manifest descriptor that can't be fetched"
            );
            return Ok(None);
        }
        bail!(
            "failed to get pointed manifest for {}/{}: statusCode: {}",
            registry,
            image,
            resp.status().as_u16()
        )
    }

    async fn list_archs_with_auth(
        &self,
        transport: &Arc<dyn Transport>,
        auth: &AuthenticationToken,
        registry: &str,
        image: &str,
        tag: &str,
    ) -> Result<Vec<Platform>> {
        let registry = if registry == "docker.io" {
            "registry-1.docker.io".to_string()
        } else {
            registry.to_string()
        };
        let resp = self
            .get_image_manifest(
                transport,
                auth,
                &registry,
                image,
                tag,
                &[
                    "application/vnd.oci.image.index.v1+json",
                    "application/vnd.docker.distribution.manifest.list.v2+json",
                    "application/vnd.oci.image.manifest.v1+json",
                    "application/vnd.docker.distribution.manifest.v2+json",
                ],
            )
            .await?;
        if resp.status() != StatusCode::OK {
            bail!(
                "failed to get manifest list for image {} in registry {} using the provider {}. Unexpected status code {}. Expecting {}",
                image,
                registry,
                auth.source.provider,
                resp.status().as_u16(),
                StatusCode::OK.as_u16()
            );
        }
        self.update_remaining_rate_limits(&registry, &resp);

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let response: RegistryManifestListResponse = serde_json::from_slice(resp.body())?;

        let mut platforms = Vec::new();
        if MANIFEST_LIST_MEDIA_TYPES.contains(&content_type.as_str()) {
            let mut verifications = FuturesUnordered::new();
            for manifest in &response.manifests {
                if manifest.platform.architecture == "unknown" {
                    info!(
                        registry = registry.as_str(),
                        image = image,
                        "skipping descriptor with an unknown platform"
                    );
                    continue;
                }
                if !self.is_arch_schedulable(&manifest.platform.architecture) {
                    info!(
                        arch = manifest.platform.architecture.as_str(),
                        registry = registry.as_str(),
                        image = image,
                        "skipping descriptor not in the schedulable architectures"
                    );
                    continue;
                }
                verifications
                    .push(self.verify_manifest_ref(transport, auth, &registry, image, manifest));
            }
            while let Some(verified) = verifications.next().await {
                if let Some(platform) = verified? {
                    platforms.push(platform);
                }
            }
        } else if !response.architecture.is_empty() {
            platforms.push(Platform {
                architecture: response.architecture,
                os: String::new(),
                variant: String::new(),
            });
        }
        Ok(platforms)
    }
}

#[async_trait]
impl Registry for PlainRegistry {
    async fn list_archs(&self, image_pull_secret: &str, image: &str) -> Result<Vec<Platform>> {
        let parsed = self.parse_image(image);
        let transport: Arc<dyn Transport> = Arc::new(WwwAuthenticateTransport::new(
            self.transport.clone(),
            self.authenticate_cache.clone(),
            self.cache_metrics.clone(),
        ));

        let (candidates_tx, mut candidates_rx) = mpsc::channel(1);
        let chain = self.authenticator.clone();
        let producer_args = (
            image_pull_secret.to_string(),
            parsed.registry.clone(),
            parsed.image.clone(),
            parsed.tag.clone(),
        );
        tokio::spawn(async move {
            let (pull_secret, registry, image, tag) = producer_args;
            chain
                .authenticate(&pull_secret, &registry, &image, &tag, &candidates_tx)
                .await;
        });

        let mut last_err = None;
        while let Some(auth) = candidates_rx.recv().await {
            match self
                .list_archs_with_auth(&transport, &auth, &parsed.registry, &parsed.image, &parsed.tag)
                .await
            {
                Ok(platforms) => {
                    // A v2 manifest with no architecture field is almost
                    // always linux/amd64.
                    if platforms.is_empty() {
                        return Ok(vec![Platform::new("amd64", "linux")]);
                    }
                    return Ok(platforms);
                }
                Err(err) => {
                    debug!(image = image, error = %err, "attempt failed, trying next candidate");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => bail!("unable to find image architecture"),
        }
    }
}
