//! HTTP transport plumbing shared by the registry client
//!
//! Everything that talks to a registry goes through the [`Transport`] trait so
//! that middlewares (www-authenticate negotiation, request serialisation) can
//! be stacked and tests can substitute scripted transports.

use anyhow::Result;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub type HttpRequest = Request<Full<Bytes>>;
pub type HttpResponse = Response<Bytes>;

/// A single HTTP exchange with the body fully collected.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: HttpRequest) -> Result<HttpResponse>;
}

/// Transport implementation for a plain function, mostly useful in tests.
pub struct TransportFunc<F>(pub F);

#[async_trait]
impl<F, Fut> Transport for TransportFunc<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HttpResponse>> + Send,
{
    async fn round_trip(&self, req: HttpRequest) -> Result<HttpResponse> {
        (self.0)(req).await
    }
}

/// Default transport over hyper with TLS support.
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HyperTransport {
    pub fn new() -> Self {
        let https = HttpsConnector::new();
        let client = Client::builder(TokioExecutor::new()).build(https);
        Self { client }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn round_trip(&self, req: HttpRequest) -> Result<HttpResponse> {
        let resp = self.client.request(req).await?;
        let (parts, body) = resp.into_parts();
        let bytes = body.collect().await?.to_bytes();
        Ok(Response::from_parts(parts, bytes))
    }
}

struct KeyState {
    semaphore: Arc<Semaphore>,
    in_flight: usize,
}

/// Serialises concurrent identical requests instead of running them in
/// parallel. Sitting in front of a caching layer, this reduces the request
/// rate to the upstream services.
///
/// Requests are grouped by `method + URL`; each group admits at most
/// `concurrent_calls_limit` requests at a time, the rest wait on the shared
/// semaphore.
pub struct SerializedTransport {
    transport: Arc<dyn Transport>,
    concurrent_calls_limit: usize,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl SerializedTransport {
    pub fn new(transport: Arc<dyn Transport>, concurrent_calls_limit: usize) -> Self {
        Self {
            transport,
            concurrent_calls_limit: concurrent_calls_limit.max(1),
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn key(req: &HttpRequest) -> String {
        format!("{} {}", req.method(), req.uri())
    }

    fn checkout(&self, key: &str) -> Arc<Semaphore> {
        let mut keys = self.keys.lock().unwrap();
        let state = keys.entry(key.to_string()).or_insert_with(|| KeyState {
            semaphore: Arc::new(Semaphore::new(self.concurrent_calls_limit)),
            in_flight: 0,
        });
        state.in_flight += 1;
        state.semaphore.clone()
    }

    fn checkin(&self, key: &str) {
        let mut keys = self.keys.lock().unwrap();
        if let Some(state) = keys.get_mut(key) {
            state.in_flight -= 1;
            if state.in_flight == 0 {
                keys.remove(key);
            }
        }
    }
}

#[async_trait]
impl Transport for SerializedTransport {
    async fn round_trip(&self, req: HttpRequest) -> Result<HttpResponse> {
        let key = Self::key(&req);
        let semaphore = self.checkout(&key);
        let result = async {
            let _permit = semaphore.acquire().await?;
            self.transport.round_trip(req).await
        }
        .await;
        self.checkin(&key);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn response(status: StatusCode, body: &str) -> HttpResponse {
        Response::builder()
            .status(status)
            .body(Bytes::copy_from_slice(body.as_bytes()))
            .unwrap()
    }

    fn request(uri: &str) -> HttpRequest {
        Request::builder()
            .method(hyper::Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_identical_requests_are_serialised() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let counted_in_flight = in_flight.clone();
        let counted_max = max_in_flight.clone();
        let transport = Arc::new(SerializedTransport::new(
            Arc::new(TransportFunc(move |_req| {
                let in_flight = counted_in_flight.clone();
                let max = counted_max.clone();
                async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(response(StatusCode::OK, "ok"))
                }
            })),
            1,
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                transport
                    .round_trip(request("http://registry.example.com/v2/"))
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert!(transport.keys.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_distinct_requests_run_in_parallel() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let counted_in_flight = in_flight.clone();
        let counted_max = max_in_flight.clone();
        let transport = Arc::new(SerializedTransport::new(
            Arc::new(TransportFunc(move |_req| {
                let in_flight = counted_in_flight.clone();
                let max = counted_max.clone();
                async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(response(StatusCode::OK, "ok"))
                }
            })),
            1,
        ));

        let mut handles = Vec::new();
        for i in 0..4 {
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                transport
                    .round_trip(request(&format!("http://registry.example.com/v2/{}", i)))
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert!(max_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_transport_errors_are_propagated() {
        let transport = SerializedTransport::new(
            Arc::new(TransportFunc(|_req| async {
                Err(anyhow::anyhow!("connection refused"))
            })),
            1,
        );
        let err = transport
            .round_trip(request("http://registry.example.com/v2/"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(transport.keys.lock().unwrap().is_empty());
    }
}
