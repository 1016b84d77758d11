//! End-to-end admission flow over a scripted registry transport:
//! authenticator chain, bearer negotiation, manifest-list traversal, caching
//! and the placement mutation.

use anyhow::Result;
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use hyper::{Method, Response, StatusCode};
use k8s_openapi::api::core::v1::{Event, Node, Pod, Secret};
use noe::hook::Handler;
use noe::httputils::{HttpRequest, HttpResponse, Transport, TransportFunc};
use noe::kubeapi::ClusterClient;
use noe::registry::auth::{AnonymousAuthenticator, AuthenticatorChain, ImagePullSecretAuthenticator};
use noe::registry::cached::CachedRegistry;
use noe::registry::{PlainRegistry, Registry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MemoryClusterClient {
    events: Mutex<HashMap<(String, String), Event>>,
}

#[async_trait]
impl ClusterClient for MemoryClusterClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        anyhow::bail!("secret {}/{} not found", namespace, name)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        anyhow::bail!("node {} not found", name)
    }

    async fn get_pod(&self, _namespace: &str, _name: &str) -> Result<Option<Pod>> {
        Ok(None)
    }

    async fn delete_pod(&self, _namespace: &str, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn get_event(&self, namespace: &str, name: &str) -> Result<Option<Event>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_event(&self, namespace: &str, event: &Event) -> Result<()> {
        let name = event.metadata.name.clone().unwrap_or_default();
        self.events
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name), event.clone());
        Ok(())
    }

    async fn replace_event(&self, namespace: &str, name: &str, event: &Event) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), event.clone());
        Ok(())
    }
}

/// A registry that challenges for a bearer token and serves a two-arch
/// manifest list for `library/ubuntu`.
fn scripted_registry_transport(manifest_requests: Arc<AtomicUsize>) -> Arc<dyn Transport> {
    Arc::new(TransportFunc(move |req: HttpRequest| {
        let manifest_requests = manifest_requests.clone();
        async move {
            let authorized = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                == Some("Bearer hub-token");
            let uri = req.uri().to_string();
            if uri.starts_with("https://auth.docker.io/token") {
                assert!(uri.contains("scope=repository:library/ubuntu:pull"));
                return Ok(Response::builder()
                    .status(StatusCode::OK)
                    .body(Bytes::from(r#"{"token":"hub-token","expires_in":300}"#))
                    .unwrap());
            }
            if !authorized {
                return Ok(Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .header(
                        WWW_AUTHENTICATE,
                        r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io""#,
                    )
                    .body(Bytes::new())
                    .unwrap());
            }
            if req.method() == Method::HEAD {
                return Ok(Response::builder()
                    .status(StatusCode::OK)
                    .body(Bytes::new())
                    .unwrap());
            }
            let response: HttpResponse = match req.uri().path() {
                "/v2/library/ubuntu/manifests/latest" => {
                    manifest_requests.fetch_add(1, Ordering::SeqCst);
                    Response::builder()
                        .status(StatusCode::OK)
                        .header(
                            "content-type",
                            "application/vnd.oci.image.index.v1+json",
                        )
                        .body(Bytes::from(
                            serde_json::json!({
                                "manifests": [
                                    {"platform": {"architecture": "amd64", "os": "linux"}, "digest": "sha256:amd64"},
                                    {"platform": {"architecture": "arm64", "os": "linux"}, "digest": "sha256:arm64"},
                                    {"platform": {"architecture": "amd64", "os": "windows"}, "digest": "sha256:windows"},
                                ]
                            })
                            .to_string(),
                        ))
                        .unwrap()
                }
                "/v2/library/ubuntu/manifests/sha256:amd64"
                | "/v2/library/ubuntu/manifests/sha256:arm64"
                | "/v2/library/ubuntu/manifests/sha256:windows" => Response::builder()
                    .status(StatusCode::OK)
                    .header(
                        "content-type",
                        "application/vnd.oci.image.manifest.v1+json",
                    )
                    .body(Bytes::from("{}"))
                    .unwrap(),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Bytes::new())
                    .unwrap(),
            };
            Ok(response)
        }
    }))
}

fn admission_review(object: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "review-uid",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "operation": "CREATE",
            "userInfo": {},
            "namespace": "default",
            "object": object,
            "dryRun": false,
        },
    })
}

#[tokio::test]
async fn test_admission_resolves_architectures_through_the_full_pipeline() {
    let manifest_requests = Arc::new(AtomicUsize::new(0));
    let prometheus_registry = prometheus::Registry::new();

    let authenticator = AuthenticatorChain::new(vec![
        Arc::new(ImagePullSecretAuthenticator),
        Arc::new(AnonymousAuthenticator::new(vec![])),
    ]);
    let plain = PlainRegistry::new(
        scripted_registry_transport(manifest_requests.clone()),
        Arc::new(authenticator),
        &prometheus_registry,
    )
    .unwrap();
    let registry: Arc<dyn Registry> = Arc::new(
        CachedRegistry::new(
            Arc::new(plain),
            Duration::from_secs(3600),
            &prometheus_registry,
        )
        .unwrap(),
    );
    let handler = Handler::new(
        Arc::new(MemoryClusterClient::default()),
        registry,
        &prometheus_registry,
    )
    .unwrap()
    .with_os("linux");

    let pod = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": "web", "namespace": "default"},
        "spec": {"containers": [{"name": "main", "image": "ubuntu"}]},
    });

    let review = handler.handle(admission_review(pod.clone())).await;
    let response = review.response.expect("expected a response");
    assert!(response.allowed);
    let patch = String::from_utf8(response.patch.expect("expected a patch")).unwrap();
    assert!(patch.contains("kubernetes.io/arch"));
    assert!(patch.contains("amd64"));
    assert!(patch.contains("arm64"));
    // The windows/amd64 descriptor is resolved but filtered by the system OS,
    // so amd64 must still be permitted through the linux descriptor.
    assert_eq!(manifest_requests.load(Ordering::SeqCst), 1);

    // A second admission for the same image is served from the cache.
    let review = handler.handle(admission_review(pod)).await;
    assert!(review.response.expect("expected a response").allowed);
    assert_eq!(manifest_requests.load(Ordering::SeqCst), 1);
}
