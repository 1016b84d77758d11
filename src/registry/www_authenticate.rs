//! www-authenticate bearer challenge negotiation
//!
//! Wraps a base transport: probes the target with a HEAD request, honours a
//! `401` challenge by exchanging it for a token at the advertised realm, and
//! attaches the resulting Authorization header to the real request. Tokens
//! with a positive `expires_in` are cached for exactly that long.

use crate::cache::{Cache, CacheMetrics};
use crate::httputils::{HttpRequest, HttpResponse, Transport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use hyper::{Method, Request, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RegistryAuthResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    #[allow(dead_code)]
    issued_at: String,
}

pub struct WwwAuthenticateTransport {
    transport: Arc<dyn Transport>,
    cache: Arc<Cache<String>>,
    cache_metrics: Arc<CacheMetrics>,
}

impl WwwAuthenticateTransport {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<Cache<String>>,
        cache_metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            transport,
            cache,
            cache_metrics,
        }
    }
}

/// Splits a `www-authenticate` header into its scheme and parameter pairs.
fn parse_www_authenticate(value: &str) -> Result<(String, BTreeMap<String, String>)> {
    let (kind, params) = value
        .split_once(' ')
        .context("malformed www-authenticate header")?;
    let mut pairs = BTreeMap::new();
    for pair in params.split(',') {
        if let Some((key, value)) = pair.trim().split_once('=') {
            pairs.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    Ok((kind.to_string(), pairs))
}

fn encode_query_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' | b'/' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

/// Builds the token request for a challenge: a GET against the realm with
/// every challenge parameter copied into the query string and the scope
/// pinned to pulling the image's repository.
fn new_token_request(
    kind: &str,
    mut params: BTreeMap<String, String>,
    image: &str,
) -> Result<(String, HttpRequest)> {
    let realm = params
        .get("realm")
        .cloned()
        .context("www-authenticate challenge without realm")?;
    params.insert("scope".to_string(), format!("repository:{}:pull", image));
    let base = realm.split_once('?').map(|(base, _)| base).unwrap_or(&realm);
    let query = params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                encode_query_component(key),
                encode_query_component(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&");
    let uri = format!("{}?{}", base, query);
    let request = Request::builder()
        .method(Method::GET)
        .uri(&uri)
        .body(Full::new(Bytes::new()))?;
    Ok((kind.to_string(), request))
}

/// Repository path out of a manifest URL: `/v2/<repo...>/manifests/<ref>`.
fn image_from_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < 4 {
        return String::new();
    }
    parts[2..parts.len() - 2].join("/")
}

#[async_trait]
impl Transport for WwwAuthenticateTransport {
    async fn round_trip(&self, mut req: HttpRequest) -> Result<HttpResponse> {
        let image = image_from_path(req.uri().path());
        let incoming_auth = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let cache_key = sha256::digest(format!("{}{}", image, incoming_auth));

        self.cache_metrics.requests.inc();
        // Trigger a cleanup of the cache, but don't wait for it to finish.
        // Waiting for the cleanup would slow down the response.
        let cache = self.cache.clone();
        tokio::spawn(async move { cache.clean_up(Instant::now()) });

        let mut probe = Request::builder()
            .method(Method::HEAD)
            .uri(req.uri().clone())
            .body(Full::new(Bytes::new()))?;
        for (name, value) in req.headers() {
            probe.headers_mut().append(name.clone(), value.clone());
        }
        let cached_auth = self.cache.load(&cache_key);
        if let Some(auth) = &cached_auth {
            debug!(cache_key = cache_key.as_str(), image = image.as_str(), "using cached authentication");
            probe
                .headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(auth)?);
        } else {
            debug!(cache_key = cache_key.as_str(), image = image.as_str(), "no cached authentication found");
        }

        let probe_resp = self.transport.round_trip(probe).await?;
        if probe_resp.status() == StatusCode::UNAUTHORIZED {
            let challenge = probe_resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            let (kind, params) = match parse_www_authenticate(challenge) {
                Ok(parsed) => parsed,
                Err(_) => return Ok(probe_resp),
            };
            let (kind, token_req) = match new_token_request(&kind, params, &image) {
                Ok(built) => built,
                Err(_) => return Ok(probe_resp),
            };
            let token_resp = match self.transport.round_trip(token_req).await {
                Ok(resp) => resp,
                Err(_) => return Ok(probe_resp),
            };
            if token_resp.status() != StatusCode::OK {
                return Ok(probe_resp);
            }
            let auth_response: RegistryAuthResponse =
                match serde_json::from_slice(token_resp.body()) {
                    Ok(decoded) => decoded,
                    Err(_) => return Ok(probe_resp),
                };
            let auth = format!("{} {}", kind, auth_response.token);
            debug!(image = image.as_str(), "using fresh authentication");
            req.headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(&auth)?);
            self.cache_metrics.responses.with_label_values(&["miss"]).inc();
            if auth_response.expires_in > 0 {
                debug!(
                    expires_in = auth_response.expires_in,
                    "caching authentication token"
                );
                self.cache.store_with_expiry(
                    &cache_key,
                    auth,
                    Instant::now() + Duration::from_secs(auth_response.expires_in as u64),
                );
            }
        } else if let Some(auth) = cached_auth {
            self.cache_metrics.responses.with_label_values(&["hit"]).inc();
            debug!(image = image.as_str(), "using cached authentication");
            req.headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(&auth)?);
        }

        self.transport.round_trip(req).await
    }
}
