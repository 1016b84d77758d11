//! Pod reconciliation
//!
//! Watches running pods and verifies that the node each pod landed on has an
//! architecture supported by every image. Mis-placed pods are deleted with a
//! `PlatformMismatch` event so their controller reschedules them under the
//! constraints injected by the admission hook.

use crate::events::{upsert_event, EventOwner};
use crate::hook::{get_container_images, get_image_pull_secret_from_pod_spec, pod_spec_has_node_architecture_selection};
use crate::kubeapi::ClusterClient;
use crate::registry::{Platform, Registry};
use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::ResourceExt;
use prometheus::{GaugeVec, IntCounterVec, Opts};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct ControllerMetrics {
    pub image_count: GaugeVec,
    pub pod_deleted_total: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new(prefix: &str, registry: &prometheus::Registry) -> Result<Self> {
        let image_count = GaugeVec::new(
            Opts::new(
                "count",
                "Number of images in the cluster at a given point in time.",
            )
            .namespace(prefix)
            .subsystem("images"),
            &["image", "os", "arch", "variant"],
        )?;
        let pod_deleted_total = IntCounterVec::new(
            Opts::new(
                "deletion_total",
                "Total number of pods deleted because scheduled on mismatching instance architecture.",
            )
            .namespace(prefix)
            .subsystem("pods"),
            &["namespace", "status"],
        )?;
        registry.register(Box::new(image_count.clone()))?;
        registry.register(Box::new(pod_deleted_total.clone()))?;
        Ok(Self {
            image_count,
            pod_deleted_total,
        })
    }
}

struct ImageUsage {
    platforms: Vec<Platform>,
    refcount: i64,
}

pub struct PodReconciler {
    client: Arc<dyn ClusterClient>,
    registry: Arc<dyn Registry>,
    // Workload accounting for the images gauge: both maps move together.
    pod_images: Mutex<HashMap<String, Vec<String>>>,
    image_platforms: Mutex<HashMap<String, ImageUsage>>,
    metrics: ControllerMetrics,
}

impl PodReconciler {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        registry: Arc<dyn Registry>,
        prometheus_registry: &prometheus::Registry,
    ) -> Result<Self> {
        Ok(Self {
            client,
            registry,
            pod_images: Mutex::new(HashMap::new()),
            image_platforms: Mutex::new(HashMap::new()),
            metrics: ControllerMetrics::new("noe", prometheus_registry)?,
        })
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let key = format!("{}/{}", namespace, name);
        debug!(pod = key.as_str(), "reconciling pod");

        let pod = match self.client.get_pod(namespace, name).await? {
            Some(pod) => pod,
            None => {
                self.delete_from_caches(&key);
                return Ok(Action::await_change());
            }
        };
        if self.is_tracked(&key) || pod_is_ready(&pod) {
            info!(pod = key.as_str(), "pod was already processed");
            return Ok(Action::await_change());
        }
        let Some(spec) = pod.spec.as_ref() else {
            return Ok(Action::await_change());
        };

        let images = get_container_images(&[
            spec.init_containers.as_deref().unwrap_or(&[]),
            spec.containers.as_slice(),
        ]);

        let (image_pull_secret, pull_secret_failed) =
            get_image_pull_secret_from_pod_spec(self.client.as_ref(), namespace, spec).await;
        if pull_secret_failed {
            error!(pod = key.as_str(), "failed to get image pull secret from pod spec");
        }

        let (node_os, node_arch) = match spec.node_name.as_deref() {
            Some(node_name) if !node_name.is_empty() => {
                // The pod was already scheduled.
                let node = self.client.get_node(node_name).await.map_err(|err| {
                    error!(node = node_name, error = %err, "failed to get node spec");
                    err
                })?;
                let labels = node.metadata.labels.unwrap_or_default();
                let arch = labels
                    .get("kubernetes.io/arch")
                    .or_else(|| labels.get("beta.kubernetes.io/arch"))
                    .cloned()
                    .unwrap_or_default();
                let os = labels
                    .get("kubernetes.io/os")
                    .or_else(|| labels.get("beta.kubernetes.io/os"))
                    .cloned()
                    .unwrap_or_default();
                (os, arch)
            }
            _ => (String::new(), String::new()),
        };

        // Registry errors requeue before any accounting happens, so the
        // tracking maps never move apart.
        let mut gathered = Vec::new();
        for image in &images {
            let platforms = self.registry.list_archs(&image_pull_secret, image).await?;
            gathered.push((image.clone(), platforms));
        }
        for (image, platforms) in &gathered {
            self.increment_platform_statistics(image, platforms);
        }
        self.add_to_cache(&key, images);

        let mut scheduled_on_matching_node = true;
        if !node_os.is_empty() && !node_arch.is_empty() {
            for (_, platforms) in &gathered {
                let has_matching_platform = platforms
                    .iter()
                    .any(|platform| platform.os == node_os && platform.architecture == node_arch);
                if !has_matching_platform {
                    scheduled_on_matching_node = false;
                }
            }
        }
        if scheduled_on_matching_node {
            return Ok(Action::await_change());
        }
        if pod_spec_has_node_architecture_selection(spec).is_some() {
            info!(pod = key.as_str(), "pod has node architecture selection");
            return Ok(Action::await_change());
        }
        warn!(pod = key.as_str(), "pod scheduled on node with no matching platform");
        self.delete_pod_and_notify_user(&pod).await;

        Ok(Action::await_change())
    }

    fn add_to_cache(&self, key: &str, images: Vec<String>) {
        self.pod_images.lock().unwrap().insert(key.to_string(), images);
    }

    fn is_tracked(&self, key: &str) -> bool {
        self.pod_images.lock().unwrap().contains_key(key)
    }

    fn delete_from_caches(&self, key: &str) {
        let images = self.pod_images.lock().unwrap().remove(key);
        for image in images.into_iter().flatten() {
            self.decrement_platform_statistics(&image);
        }
    }

    fn increment_platform_statistics(&self, image: &str, platforms: &[Platform]) {
        let mut image_platforms = self.image_platforms.lock().unwrap();
        if let Some(usage) = image_platforms.get_mut(image) {
            for old_platform in &usage.platforms {
                if !platforms.contains(old_platform) {
                    // An image in use has been updated and no longer supports
                    // the platform.
                    let _ = self.metrics.image_count.remove_label_values(&[
                        image,
                        &old_platform.os,
                        &old_platform.architecture,
                        &old_platform.variant,
                    ]);
                }
            }
            usage.platforms = platforms.to_vec();
            usage.refcount += 1;
        } else {
            image_platforms.insert(
                image.to_string(),
                ImageUsage {
                    platforms: platforms.to_vec(),
                    refcount: 1,
                },
            );
        }
        for platform in platforms {
            self.metrics
                .image_count
                .with_label_values(&[image, &platform.os, &platform.architecture, &platform.variant])
                .inc();
        }
    }

    fn decrement_platform_statistics(&self, image: &str) {
        let mut image_platforms = self.image_platforms.lock().unwrap();
        let Some(usage) = image_platforms.get_mut(image) else {
            return;
        };
        usage.refcount -= 1;
        let emptied = usage.refcount == 0;
        for platform in &usage.platforms {
            self.metrics
                .image_count
                .with_label_values(&[image, &platform.os, &platform.architecture, &platform.variant])
                .dec();
            if emptied {
                let _ = self.metrics.image_count.remove_label_values(&[
                    image,
                    &platform.os,
                    &platform.architecture,
                    &platform.variant,
                ]);
            }
        }
        if emptied {
            image_platforms.remove(image);
        }
    }

    async fn delete_pod_and_notify_user(&self, pod: &Pod) {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let result = self.client.delete_pod(&namespace, &name).await;

        let (event_type, name_suffix, message_prefix) = match &result {
            Ok(()) => {
                self.metrics
                    .pod_deleted_total
                    .with_label_values(&[&namespace, "success"])
                    .inc();
                info!(pod = name.as_str(), "deleted pod scheduled on node with no matching platform");
                (
                    "Normal",
                    "deleted-pod",
                    "Pod(s) was deleted because it was scheduled on a node with a platform that is not supported by the image:",
                )
            }
            Err(err) => {
                self.metrics
                    .pod_deleted_total
                    .with_label_values(&[&namespace, "failed"])
                    .inc();
                error!(pod = name.as_str(), error = %err, "failed to delete pod scheduled on node with no matching platform");
                (
                    "Warning",
                    "failed-to-delete-pod",
                    "Failed to delete pod(s) scheduled on a node with a platform that is not supported by the image. Pod(s):",
                )
            }
        };
        // Give visibility to the user for both the pod and its owner.
        upsert_event(
            self.client.as_ref(),
            &EventOwner::for_pod(pod),
            event_type,
            "PlatformMismatch",
            name_suffix,
            message_prefix,
            &name,
        )
        .await;
        for owner in EventOwner::controllers_of_pod(pod) {
            upsert_event(
                self.client.as_ref(),
                &owner,
                event_type,
                "PlatformMismatch",
                name_suffix,
                message_prefix,
                &name,
            )
            .await;
        }
    }
}

/// A pod with a `Ready=True` condition runs on a compatible node already.
fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .any(|condition| condition.type_ == "Ready" && condition.status == "True")
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ReconcileError(#[from] anyhow::Error);

/// Runs the pod reconciler under the controller runtime until the watch
/// stream terminates.
pub async fn run_pod_controller(reconciler: Arc<PodReconciler>, client: kube::Client) {
    let pods: Api<Pod> = Api::all(client);
    Controller::new(pods, watcher::Config::default())
        .run(
            |pod: Arc<Pod>, reconciler: Arc<PodReconciler>| async move {
                let namespace = pod.namespace().unwrap_or_default();
                let name = pod.name_any();
                reconciler
                    .reconcile(&namespace, &name)
                    .await
                    .map_err(ReconcileError)
            },
            |_pod, err: &ReconcileError, _reconciler| {
                warn!(error = %err, "pod reconciliation failed, requeueing");
                Action::requeue(Duration::from_secs(10))
            },
            reconciler,
        )
        .for_each(|result| async move {
            match result {
                Ok(object) => debug!(object = ?object, "reconciled pod"),
                Err(err) => warn!(error = %err, "pod reconciliation error"),
            }
        })
        .await;
}
