//! Abstract control-plane client
//!
//! The hook and the reconciler only need a handful of operations: reading
//! secrets, nodes and pods, deleting pods, and upserting events. Keeping them
//! behind a trait lets tests run against an in-memory cluster.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Node, Pod, Secret};
use kube::api::{Api, DeleteParams, PostParams};

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;
    async fn get_node(&self, name: &str) -> Result<Node>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
    async fn get_event(&self, namespace: &str, name: &str) -> Result<Option<Event>>;
    async fn create_event(&self, namespace: &str, event: &Event) -> Result<()>;
    async fn replace_event(&self, namespace: &str, name: &str, event: &Event) -> Result<()>;
}

/// ClusterClient implementation over a kube client.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: kube::Client,
}

impl KubeClusterClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .with_context(|| format!("failed to read secret {}/{}", namespace, name))
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get(name)
            .await
            .with_context(|| format!("failed to read node {}", name))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .with_context(|| format!("failed to read pod {}/{}", namespace, name))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("failed to delete pod {}/{}", namespace, name))?;
        Ok(())
    }

    async fn get_event(&self, namespace: &str, name: &str) -> Result<Option<Event>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .with_context(|| format!("failed to read event {}/{}", namespace, name))
    }

    async fn create_event(&self, namespace: &str, event: &Event) -> Result<()> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), event)
            .await
            .context("failed to create event")?;
        Ok(())
    }

    async fn replace_event(&self, namespace: &str, name: &str, event: &Event) -> Result<()> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), event)
            .await
            .with_context(|| format!("failed to replace event {}/{}", namespace, name))?;
        Ok(())
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory cluster used across hook, controller and event tests.
    #[derive(Default)]
    pub struct FakeClusterClient {
        pub secrets: Mutex<HashMap<(String, String), Secret>>,
        pub nodes: Mutex<HashMap<String, Node>>,
        pub pods: Mutex<HashMap<(String, String), Pod>>,
        pub deleted_pods: Mutex<Vec<String>>,
        pub events: Mutex<HashMap<(String, String), Event>>,
        pub fail_pod_deletions: bool,
    }

    impl FakeClusterClient {
        pub fn with_secret(self, namespace: &str, name: &str, secret: Secret) -> Self {
            self.secrets
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name.to_string()), secret);
            self
        }

        pub fn with_node(self, name: &str, node: Node) -> Self {
            self.nodes.lock().unwrap().insert(name.to_string(), node);
            self
        }

        pub fn with_pod(self, namespace: &str, name: &str, pod: Pod) -> Self {
            self.pods
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name.to_string()), pod);
            self
        }

        pub fn event(&self, namespace: &str, name: &str) -> Option<Event> {
            self.events
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }
    }

    #[async_trait]
    impl ClusterClient for FakeClusterClient {
        async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
            self.secrets
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .with_context(|| format!("secret {}/{} not found", namespace, name))
        }

        async fn get_node(&self, name: &str) -> Result<Node> {
            self.nodes
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .with_context(|| format!("node {} not found", name))
        }

        async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
            Ok(self
                .pods
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
            if self.fail_pod_deletions {
                anyhow::bail!("pod deletion forbidden");
            }
            self.pods
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()));
            self.deleted_pods
                .lock()
                .unwrap()
                .push(format!("{}/{}", namespace, name));
            Ok(())
        }

        async fn get_event(&self, namespace: &str, name: &str) -> Result<Option<Event>> {
            Ok(self.event(namespace, name))
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
}
