//! Admission-side placement resolution
//!
//! For workload CREATE requests, resolves the architectures supported by
//! every referenced image and mutates the node placement constraints so the
//! scheduler only considers nodes that can execute all of them.

use crate::events::{upsert_event, EventOwner};
use crate::kubeapi::ClusterClient;
use crate::registry::auth::DockerConfig;
use crate::registry::Registry;
use anyhow::Result;
use json_patch::Patch;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{
    Affinity, Container, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    Pod, PodSpec,
};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use prometheus::{IntCounterVec, Opts};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

pub const ARCH_KEY: &str = "kubernetes.io/arch";
pub const BETA_ARCH_KEY: &str = "beta.kubernetes.io/arch";
pub const PREFERRED_ARCH_LABEL: &str = "arch.noe.adevinta.com/preferred";

/// A non-fatal condition surfaced as an admission warning while the patch is
/// still applied.
#[derive(Debug)]
pub struct Warning(pub String);

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Warning {}

pub struct HandlerMetrics {
    pub image_pull_secret_failed: IntCounterVec,
    pub registry_errors: IntCounterVec,
    pub update_skip: IntCounterVec,
    pub arch_selector_injected: IntCounterVec,
    pub preferred_architecture_not_available: IntCounterVec,
    pub node_match_injections: IntCounterVec,
}

impl HandlerMetrics {
    pub fn new(prefix: &str, registry: &prometheus::Registry) -> Result<Self> {
        let image_pull_secret_failed = IntCounterVec::new(
            Opts::new(
                "image_pull_secret_failed_total",
                "Number of times the image pull secret could not be retrieved",
            )
            .namespace(prefix)
            .subsystem("hook"),
            &["namespace"],
        )?;
        let registry_errors = IntCounterVec::new(
            Opts::new(
                "registry_errors_total",
                "Number of times the registry returned an error",
            )
            .namespace(prefix)
            .subsystem("hook"),
            &["image"],
        )?;
        let update_skip = IntCounterVec::new(
            Opts::new("update_skip_total", "Number of times the update was skipped")
                .namespace(prefix)
                .subsystem("hook"),
            &["reason"],
        )?;
        let arch_selector_injected = IntCounterVec::new(
            Opts::new(
                "arch_selector_injected_total",
                "Number of times the arch selector was injected",
            )
            .namespace(prefix)
            .subsystem("hook"),
            &["namespace", "selector"],
        )?;
        let preferred_architecture_not_available = IntCounterVec::new(
            Opts::new(
                "preferred_architecture_not_available_total",
                "Number of times the preferred architecture was not available",
            )
            .namespace(prefix)
            .subsystem("hook"),
            &["namespace"],
        )?;
        let node_match_injections = IntCounterVec::new(
            Opts::new(
                "node_match_injections_total",
                "Number of times the node selection to match pod labels was injected",
            )
            .namespace(prefix)
            .subsystem("hook"),
            &["namespace", "label"],
        )?;
        registry.register(Box::new(image_pull_secret_failed.clone()))?;
        registry.register(Box::new(registry_errors.clone()))?;
        registry.register(Box::new(update_skip.clone()))?;
        registry.register(Box::new(arch_selector_injected.clone()))?;
        registry.register(Box::new(preferred_architecture_not_available.clone()))?;
        registry.register(Box::new(node_match_injections.clone()))?;
        Ok(Self {
            image_pull_secret_failed,
            registry_errors,
            update_skip,
            arch_selector_injected,
            preferred_architecture_not_available,
            node_match_injections,
        })
    }
}

/// Every image referenced by the given container lists.
pub fn get_container_images(container_lists: &[&[Container]]) -> Vec<String> {
    let mut images = Vec::new();
    for containers in container_lists {
        for container in containers.iter() {
            if let Some(image) = &container.image {
                if !image.is_empty() {
                    images.push(image.clone());
                }
            }
        }
    }
    images
}

/// Whether the pod spec already constrains the node architecture, and why.
pub fn pod_spec_has_node_architecture_selection(pod_spec: &PodSpec) -> Option<&'static str> {
    if let Some(node_selector) = &pod_spec.node_selector {
        for key in [BETA_ARCH_KEY, ARCH_KEY] {
            if node_selector.contains_key(key) {
                info!("pod affinity was already set");
                return Some("node-selector found");
            }
        }
    }
    let terms = pod_spec
        .affinity
        .as_ref()
        .and_then(|affinity| affinity.node_affinity.as_ref())
        .and_then(|node_affinity| {
            node_affinity
                .required_during_scheduling_ignored_during_execution
                .as_ref()
        })
        .map(|selector| &selector.node_selector_terms);
    for term in terms.into_iter().flatten() {
        for expression in term.match_expressions.iter().flatten() {
            if expression.key == ARCH_KEY || expression.key == BETA_ARCH_KEY {
                info!("pod affinity was already set");
                return Some("node affinity label selector found");
            }
        }
        for field in term.match_fields.iter().flatten() {
            if field.key == "metadata.name" {
                info!("pod affinity was already set");
                return Some("node affinity field selector found");
            }
        }
    }
    None
}

/// Merges the `.dockerconfigjson` of every referenced pull secret into one
/// docker config blob. Individual failures are reported but do not abort.
pub async fn get_image_pull_secret_from_pod_spec(
    client: &dyn ClusterClient,
    namespace: &str,
    pod_spec: &PodSpec,
) -> (String, bool) {
    let mut merged = DockerConfig::default();
    let mut failed = false;
    for reference in pod_spec.image_pull_secrets.iter().flatten() {
        let Some(name) = reference.name.as_deref() else {
            continue;
        };
        let secret = match client.get_secret(namespace, name).await {
            Ok(secret) => secret,
            Err(err) => {
                warn!(secret = name, error = %err, "failed to read image pull secret");
                failed = true;
                continue;
            }
        };
        let Some(data) = secret
            .data
            .as_ref()
            .and_then(|data| data.get(".dockerconfigjson"))
        else {
            warn!(secret = name, "image pull secret has no .dockerconfigjson");
            failed = true;
            continue;
        };
        let cfg: DockerConfig = match serde_json::from_slice(&data.0) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(secret = name, error = %err, "failed to decode image pull secret");
                failed = true;
                continue;
            }
        };
        merged.auths.extend(cfg.auths);
    }
    if merged.auths.is_empty() {
        return (String::new(), failed);
    }
    match serde_json::to_string(&merged) {
        Ok(encoded) => (encoded, failed),
        Err(err) => {
            warn!(error = %err, "failed to encode image pull secret");
            (String::new(), failed)
        }
    }
}

fn append_node_affinity_term(pod_spec: &mut PodSpec, requirement: NodeSelectorRequirement) {
    let affinity = pod_spec.affinity.get_or_insert_with(Affinity::default);
    let node_affinity = affinity.node_affinity.get_or_insert_with(NodeAffinity::default);
    let required = node_affinity
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(NodeSelector::default);
    required.node_selector_terms.push(NodeSelectorTerm {
        match_expressions: Some(vec![requirement]),
        ..Default::default()
    });
}

/// Splits the `key1,key2` match-node-labels flag syntax.
pub fn parse_match_node_labels(labels: &str) -> Vec<String> {
    labels
        .split(',')
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct Handler {
    client: Arc<dyn ClusterClient>,
    registry: Arc<dyn Registry>,
    match_node_labels: Vec<String>,
    metrics: HandlerMetrics,
    preferred_architecture: String,
    schedulable_architectures: Vec<String>,
    system_os: String,
}

impl Handler {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        registry: Arc<dyn Registry>,
        prometheus_registry: &prometheus::Registry,
    ) -> Result<Self> {
        Ok(Self {
            client,
            registry,
            match_node_labels: Vec::new(),
            metrics: HandlerMetrics::new("noe", prometheus_registry)?,
            preferred_architecture: String::new(),
            schedulable_architectures: Vec::new(),
            system_os: String::new(),
        })
    }

    pub fn with_architecture(mut self, architecture: &str) -> Self {
        self.preferred_architecture = architecture.to_string();
        self
    }

    pub fn with_schedulable_architectures(mut self, architectures: Vec<String>) -> Self {
        self.schedulable_architectures = architectures;
        self
    }

    pub fn with_os(mut self, os: &str) -> Self {
        self.system_os = os.to_string();
        self
    }

    pub fn with_match_node_labels(mut self, labels: Vec<String>) -> Self {
        self.match_node_labels = labels;
        self
    }

    fn is_arch_supported(&self, arch: &str) -> bool {
        self.schedulable_architectures.is_empty()
            || self.schedulable_architectures.iter().any(|a| a == arch)
    }

    fn add_pod_node_matching_labels(
        &self,
        namespace: &str,
        pod_labels: &BTreeMap<String, String>,
        pod_spec: &mut PodSpec,
    ) {
        for key in &self.match_node_labels {
            let Some(value) = pod_labels.get(key) else {
                continue;
            };
            self.metrics
                .node_match_injections
                .with_label_values(&[namespace, key])
                .inc();
            if let Some(node_selector) = pod_spec.node_selector.as_mut() {
                node_selector.insert(key.clone(), value.clone());
            } else {
                append_node_affinity_term(
                    pod_spec,
                    NodeSelectorRequirement {
                        key: key.clone(),
                        operator: "In".to_string(),
                        values: Some(vec![value.clone()]),
                    },
                );
            }
        }
    }

    /// Applies the placement decision to a pod spec. A `Warning` error means
    /// the mutation was applied but the user's preference could not be
    /// honoured; any other error is a policy rejection.
    pub async fn update_pod_spec(
        &self,
        namespace: &str,
        pod_labels: &BTreeMap<String, String>,
        pod_spec: &mut PodSpec,
    ) -> Result<()> {
        if let Some(node_name) = pod_spec.node_name.as_deref() {
            if !node_name.is_empty() {
                info!(node_name = node_name, "pod is already scheduled");
                return Ok(());
            }
        }
        if let Some(reason) = pod_spec_has_node_architecture_selection(pod_spec) {
            self.metrics.update_skip.with_label_values(&[reason]).inc();
            self.add_pod_node_matching_labels(namespace, pod_labels, pod_spec);
            return Ok(());
        }

        let mut preferred_arch_is_default = false;
        let mut preferred_arch_defined = pod_labels.contains_key(PREFERRED_ARCH_LABEL);
        let mut preferred_arch = pod_labels
            .get(PREFERRED_ARCH_LABEL)
            .cloned()
            .unwrap_or_default();
        if !preferred_arch.is_empty() && !self.is_arch_supported(&preferred_arch) {
            info!(
                preferred_arch = preferred_arch.as_str(),
                "ignoring unsupported user preferred architecture"
            );
            preferred_arch = String::new();
        }
        if preferred_arch.is_empty() && !self.preferred_architecture.is_empty() {
            preferred_arch = self.preferred_architecture.clone();
            preferred_arch_defined = true;
            preferred_arch_is_default = true;
            info!(
                preferred_arch = preferred_arch.as_str(),
                "selecting default preferred architecture"
            );
        }

        let (image_pull_secret, pull_secret_failed) =
            get_image_pull_secret_from_pod_spec(self.client.as_ref(), namespace, pod_spec).await;
        if pull_secret_failed {
            self.metrics
                .image_pull_secret_failed
                .with_label_values(&[namespace])
                .inc();
        }

        let images = get_container_images(&[
            pod_spec.containers.as_slice(),
            pod_spec.init_containers.as_deref().unwrap_or(&[]),
        ]);
        let mut common_architectures: HashSet<String> = HashSet::new();
        let mut first_image = true;
        for image in &images {
            let platforms = match self.registry.list_archs(&image_pull_secret, image).await {
                Ok(platforms) => platforms,
                Err(err) => {
                    self.metrics
                        .registry_errors
                        .with_label_values(&[image])
                        .inc();
                    warn!(image = image.as_str(), error = %err, "unable to list image archs");
                    self.add_pod_node_matching_labels(namespace, pod_labels, pod_spec);
                    return Ok(());
                }
            };
            let mut image_architectures = HashSet::new();
            for platform in platforms {
                if !platform.os.is_empty() && platform.os != self.system_os {
                    info!(os = platform.os.as_str(), "skipped OS does not match system's");
                    continue;
                }
                if !self.is_arch_supported(&platform.architecture) {
                    info!(
                        arch = platform.architecture.as_str(),
                        "skipped arch is not schedulable"
                    );
                    continue;
                }
                image_architectures.insert(platform.architecture);
            }
            if first_image {
                common_architectures = image_architectures;
                first_image = false;
            } else {
                common_architectures.retain(|arch| image_architectures.contains(arch));
            }
        }
        if first_image {
            info!("no image found");
            self.add_pod_node_matching_labels(namespace, pod_labels, pod_spec);
            return Ok(());
        }
        if common_architectures.is_empty() {
            info!("no common architecture");
            self.add_pod_node_matching_labels(namespace, pod_labels, pod_spec);
            anyhow::bail!("could not find a common image architecture across all containers");
        }

        if preferred_arch_defined && common_architectures.contains(&preferred_arch) {
            pod_spec
                .node_selector
                .get_or_insert_with(BTreeMap::new)
                .insert(ARCH_KEY.to_string(), preferred_arch.clone());
            info!("updating nodeSelector to match preferred architecture");
            self.metrics
                .arch_selector_injected
                .with_label_values(&[namespace, "preferred"])
                .inc();
        } else {
            let mut values: Vec<String> = common_architectures.iter().cloned().collect();
            values.sort();
            info!(architectures = ?values, "updating pod affinity");
            append_node_affinity_term(
                pod_spec,
                NodeSelectorRequirement {
                    key: ARCH_KEY.to_string(),
                    operator: "In".to_string(),
                    values: Some(values),
                },
            );
            self.metrics
                .arch_selector_injected
                .with_label_values(&[namespace, "affinity"])
                .inc();
            if preferred_arch_defined {
                info!("preferred architecture is not supported by all images");
                self.metrics
                    .preferred_architecture_not_available
                    .with_label_values(&[namespace])
                    .inc();
                if !preferred_arch_is_default {
                    self.add_pod_node_matching_labels(namespace, pod_labels, pod_spec);
                    return Err(anyhow::Error::new(Warning(format!(
                        "could not select preferred arch: {}",
                        preferred_arch
                    ))));
                }
            }
        }

        self.add_pod_node_matching_labels(namespace, pod_labels, pod_spec);
        Ok(())
    }

    /// Handles an admission review for workload CREATE operations. Pods and
    /// DaemonSets are mutated; everything else is allowed through unchanged.
    pub async fn handle(&self, review: serde_json::Value) -> AdmissionReview<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = match serde_json::from_value(review) {
            Ok(review) => review,
            Err(err) => {
                warn!(error = %err, "failed to decode admission review");
                return AdmissionResponse::invalid(err.to_string()).into_review();
            }
        };
        let req: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(req) => req,
            Err(err) => {
                warn!(error = %err, "failed to extract admission request");
                return AdmissionResponse::invalid(err.to_string()).into_review();
            }
        };
        let resp = AdmissionResponse::from(&req);
        match req.kind.kind.as_str() {
            "Pod" => self.handle_pod(&req, resp).await.into_review(),
            "DaemonSet" => self.handle_daemon_set(&req, resp).await.into_review(),
            other => {
                info!(kind = other, "nothing to do for this kind");
                resp.into_review()
            }
        }
    }

    async fn handle_pod(
        &self,
        req: &AdmissionRequest<DynamicObject>,
        resp: AdmissionResponse,
    ) -> AdmissionResponse {
        if !matches!(req.operation, Operation::Create) {
            info!("skipping adding node selector to pod updates");
            return resp;
        }
        let pod: Pod = match decode_object(req) {
            Ok(pod) => pod,
            Err(err) => {
                warn!(error = %err, "failed to decode pod");
                return AdmissionResponse::invalid(err.to_string());
            }
        };
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .or_else(|| req.namespace.clone())
            .unwrap_or_default();
        let labels = pod.metadata.labels.clone().unwrap_or_default();

        let mut updated = pod.clone();
        let mut warning_message = None;
        if let Some(spec) = updated.spec.as_mut() {
            if let Err(err) = self.update_pod_spec(&namespace, &labels, spec).await {
                if let Some(warning) = err.downcast_ref::<Warning>() {
                    warning_message = Some(warning.to_string());
                } else {
                    self.generate_injection_failed_event(&EventOwner::for_pod(&pod), &err)
                        .await;
                    for owner in EventOwner::controllers_of_pod(&pod) {
                        self.generate_injection_failed_event(&owner, &err).await;
                    }
                    return resp.deny(err.to_string());
                }
            }
        }
        let mut resp = match patch_response(resp, &pod, &updated) {
            Ok((resp, patched)) => {
                if patched {
                    self.generate_injection_success_event(&EventOwner::for_pod(&pod))
                        .await;
                    for owner in EventOwner::controllers_of_pod(&pod) {
                        self.generate_injection_success_event(&owner).await;
                    }
                }
                resp
            }
            Err(err) => {
                warn!(error = %err, "failed to generate patch");
                return AdmissionResponse::invalid(err.to_string());
            }
        };
        if let Some(message) = warning_message {
            resp.warnings = Some(vec![message]);
        }
        resp
    }

    async fn handle_daemon_set(
        &self,
        req: &AdmissionRequest<DynamicObject>,
        resp: AdmissionResponse,
    ) -> AdmissionResponse {
        let ds: DaemonSet = match decode_object(req) {
            Ok(ds) => ds,
            Err(err) => {
                warn!(error = %err, "failed to decode daemonset");
                return AdmissionResponse::invalid(err.to_string());
            }
        };
        let namespace = ds
            .metadata
            .namespace
            .clone()
            .or_else(|| req.namespace.clone())
            .unwrap_or_default();
        let owner = EventOwner {
            api_version: "apps/v1".to_string(),
            kind: "DaemonSet".to_string(),
            namespace: namespace.clone(),
            name: ds.metadata.name.clone().unwrap_or_default(),
            uid: ds.metadata.uid.clone().unwrap_or_default(),
        };

        let mut updated = ds.clone();
        let mut warning_message = None;
        if let Some(spec) = updated.spec.as_mut() {
            let labels = spec
                .template
                .metadata
                .as_ref()
                .and_then(|metadata| metadata.labels.clone())
                .unwrap_or_default();
            if let Some(pod_spec) = spec.template.spec.as_mut() {
                if let Err(err) = self.update_pod_spec(&namespace, &labels, pod_spec).await {
                    if let Some(warning) = err.downcast_ref::<Warning>() {
                        warning_message = Some(warning.to_string());
                    } else {
                        self.generate_injection_failed_event(&owner, &err).await;
                        return resp.deny(err.to_string());
                    }
                }
            }
        }
        let mut resp = match patch_response(resp, &ds, &updated) {
            Ok((resp, patched)) => {
                if patched {
                    self.generate_injection_success_event(&owner).await;
                }
                resp
            }
            Err(err) => {
                warn!(error = %err, "failed to generate patch");
                return AdmissionResponse::invalid(err.to_string());
            }
        };
        if let Some(message) = warning_message {
            resp.warnings = Some(vec![message]);
        }
        resp
    }

    async fn generate_injection_success_event(&self, owner: &EventOwner) {
        upsert_event(
            self.client.as_ref(),
            owner,
            "Normal",
            "InjectedNodeSelector",
            "injection-succeeded",
            &format!("Injected node selector to {}:", owner.kind),
            &owner.name,
        )
        .await;
    }

    async fn generate_injection_failed_event(&self, owner: &EventOwner, err: &anyhow::Error) {
        upsert_event(
            self.client.as_ref(),
            owner,
            "Warning",
            "FailedToInjectNodeSelector",
            "injection-failed",
            &format!("Failed to inject node selector to {}:", owner.kind),
            &format!("{}: {}", owner.name, err),
        )
        .await;
    }
}

fn decode_object<T: serde::de::DeserializeOwned>(
    req: &AdmissionRequest<DynamicObject>,
) -> Result<T> {
    let object = req
        .object
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no object in admission request"))?;
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Attaches the JSON patch between the incoming and mutated objects to the
/// response. Returns whether a patch was produced.
fn patch_response<T: Serialize>(
    resp: AdmissionResponse,
    original: &T,
    updated: &T,
) -> Result<(AdmissionResponse, bool)> {
    let patch: Patch = json_patch::diff(
        &serde_json::to_value(original)?,
        &serde_json::to_value(updated)?,
    );
    if patch.0.is_empty() {
        return Ok((resp, false));
    }
    Ok((resp.with_patch(patch)?, true))
}

#[cfg(test)]
mod tests;
