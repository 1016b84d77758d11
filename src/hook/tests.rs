use super::*;
use crate::kubeapi::testutil::FakeClusterClient;
use crate::registry::{Platform, RegistryFunc};
use k8s_openapi::api::core::v1::Secret;
use std::collections::HashMap;

fn static_registry(images: &[(&str, &[(&str, &str)])]) -> Arc<dyn Registry> {
    let mut map: HashMap<String, Vec<Platform>> = HashMap::new();
    for (image, platforms) in images {
        map.insert(
            image.to_string(),
            platforms
                .iter()
                .map(|(os, arch)| Platform::new(arch, os))
                .collect(),
        );
    }
    Arc::new(RegistryFunc(move |_secret: &str, image: &str| {
        map.get(image)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown image {}", image))
    }))
}

fn new_handler(registry: Arc<dyn Registry>) -> Handler {
    Handler::new(
        Arc::new(FakeClusterClient::default()),
        registry,
        &prometheus::Registry::new(),
    )
    .unwrap()
    .with_os("linux")
}

fn pod_spec(value: serde_json::Value) -> PodSpec {
    serde_json::from_value(value).unwrap()
}

fn arch_affinity_values(spec: &PodSpec) -> Option<Vec<String>> {
    spec.affinity
        .as_ref()?
        .node_affinity
        .as_ref()?
        .required_during_scheduling_ignored_during_execution
        .as_ref()?
        .node_selector_terms
        .iter()
        .find_map(|term| {
            term.match_expressions.as_ref()?.iter().find_map(|expression| {
                (expression.key == ARCH_KEY).then(|| expression.values.clone().unwrap_or_default())
            })
        })
}

fn arch_node_selector(spec: &PodSpec) -> Option<String> {
    spec.node_selector.as_ref()?.get(ARCH_KEY).cloned()
}

#[tokio::test]
async fn test_single_image_gets_an_affinity_over_common_architectures() {
    let handler = new_handler(static_registry(&[(
        "ubuntu",
        &[("linux", "arm64"), ("linux", "amd64"), ("windows", "amd64")],
    )]));
    let mut spec = pod_spec(serde_json::json!({
        "containers": [{"name": "main", "image": "ubuntu"}],
    }));

    handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap();

    assert_eq!(
        arch_affinity_values(&spec),
        Some(vec!["amd64".to_string(), "arm64".to_string()])
    );
    assert!(arch_node_selector(&spec).is_none());
}

#[tokio::test]
async fn test_affinity_values_are_sorted() {
    let handler = new_handler(static_registry(&[(
        "ubuntu",
        &[
            ("linux", "s390x"),
            ("linux", "arm64"),
            ("linux", "amd64"),
            ("linux", "ppc64le"),
        ],
    )]));
    let mut spec = pod_spec(serde_json::json!({
        "containers": [{"name": "main", "image": "ubuntu"}],
    }));

    handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap();

    assert_eq!(
        arch_affinity_values(&spec),
        Some(vec![
            "amd64".to_string(),
            "arm64".to_string(),
            "ppc64le".to_string(),
            "s390x".to_string(),
        ])
    );
}

#[tokio::test]
async fn test_disjoint_images_are_rejected() {
    let handler = new_handler(static_registry(&[
        ("arm-only", &[("linux", "arm64")]),
        ("amd-only", &[("linux", "amd64")]),
    ]));
    let mut spec = pod_spec(serde_json::json!({
        "containers": [
            {"name": "a", "image": "arm-only"},
            {"name": "b", "image": "amd-only"},
        ],
    }));

    let err = handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "could not find a common image architecture across all containers"
    );
    assert!(err.downcast_ref::<Warning>().is_none());
}

#[tokio::test]
async fn test_intersection_permits_exactly_the_shared_architectures() {
    let handler = new_handler(static_registry(&[
        ("multi", &[("linux", "amd64"), ("linux", "arm64")]),
        ("amd-only", &[("linux", "amd64")]),
    ]));
    let mut spec = pod_spec(serde_json::json!({
        "containers": [{"name": "a", "image": "multi"}],
        "initContainers": [{"name": "init", "image": "amd-only"}],
    }));

    handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap();
    assert_eq!(arch_affinity_values(&spec), Some(vec!["amd64".to_string()]));
}

#[tokio::test]
async fn test_unhonourable_preference_yields_a_warning() {
    let handler = new_handler(static_registry(&[(
        "ubuntu",
        &[("linux", "amd64"), ("windows", "amd64")],
    )]));
    let labels = BTreeMap::from([(
        PREFERRED_ARCH_LABEL.to_string(),
        "arm64".to_string(),
    )]);
    let mut spec = pod_spec(serde_json::json!({
        "containers": [{"name": "main", "image": "ubuntu"}],
    }));

    let err = handler
        .update_pod_spec("default", &labels, &mut spec)
        .await
        .unwrap_err();
    let warning = err.downcast_ref::<Warning>().expect("expected a warning");
    assert_eq!(warning.to_string(), "could not select preferred arch: arm64");
    // The mutation is still applied.
    assert_eq!(arch_affinity_values(&spec), Some(vec!["amd64".to_string()]));
}

#[tokio::test]
async fn test_available_preferred_architecture_sets_the_node_selector() {
    let handler = new_handler(static_registry(&[(
        "ubuntu",
        &[("linux", "amd64"), ("linux", "arm64")],
    )]))
    .with_architecture("amd64");
    let mut spec = pod_spec(serde_json::json!({
        "containers": [{"name": "main", "image": "ubuntu"}],
    }));

    handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap();
    assert_eq!(arch_node_selector(&spec), Some("amd64".to_string()));
    assert!(arch_affinity_values(&spec).is_none());
}

#[tokio::test]
async fn test_unsupported_label_preference_falls_back_to_the_default() {
    let handler = new_handler(static_registry(&[(
        "ubuntu",
        &[("linux", "amd64"), ("linux", "arm64")],
    )]))
    .with_architecture("amd64")
    .with_schedulable_architectures(vec!["amd64".to_string(), "arm64".to_string()]);
    let labels = BTreeMap::from([(
        PREFERRED_ARCH_LABEL.to_string(),
        "riscv64".to_string(),
    )]);
    let mut spec = pod_spec(serde_json::json!({
        "containers": [{"name": "main", "image": "ubuntu"}],
    }));

    handler
        .update_pod_spec("default", &labels, &mut spec)
        .await
        .unwrap();
    assert_eq!(arch_node_selector(&spec), Some("amd64".to_string()));
}

#[tokio::test]
async fn test_resolver_is_idempotent() {
    let handler = new_handler(static_registry(&[(
        "ubuntu",
        &[("linux", "amd64"), ("linux", "arm64")],
    )]));
    let mut spec = pod_spec(serde_json::json!({
        "containers": [{"name": "main", "image": "ubuntu"}],
    }));

    handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap();
    let after_first = spec.clone();
    handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap();
    assert_eq!(spec, after_first);
}

#[tokio::test]
async fn test_already_scheduled_pods_are_left_unchanged() {
    let handler = new_handler(static_registry(&[("ubuntu", &[("linux", "arm64")])]));
    let mut spec = pod_spec(serde_json::json!({
        "nodeName": "node-1",
        "containers": [{"name": "main", "image": "ubuntu"}],
    }));
    let original = spec.clone();

    handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap();
    assert_eq!(spec, original);
}

#[tokio::test]
async fn test_existing_architecture_selection_is_preserved() {
    let handler = new_handler(static_registry(&[("ubuntu", &[("linux", "arm64")])]));
    for existing in [
        serde_json::json!({
            "nodeSelector": {"kubernetes.io/arch": "amd64"},
            "containers": [{"name": "main", "image": "ubuntu"}],
        }),
        serde_json::json!({
            "nodeSelector": {"beta.kubernetes.io/arch": "amd64"},
            "containers": [{"name": "main", "image": "ubuntu"}],
        }),
        serde_json::json!({
            "affinity": {"nodeAffinity": {"requiredDuringSchedulingIgnoredDuringExecution": {
                "nodeSelectorTerms": [
                    {"matchExpressions": [{"key": "kubernetes.io/arch", "operator": "In", "values": ["amd64"]}]},
                ],
            }}},
            "containers": [{"name": "main", "image": "ubuntu"}],
        }),
        serde_json::json!({
            "affinity": {"nodeAffinity": {"requiredDuringSchedulingIgnoredDuringExecution": {
                "nodeSelectorTerms": [
                    {"matchFields": [{"key": "metadata.name", "operator": "In", "values": ["node-1"]}]},
                ],
            }}},
            "containers": [{"name": "main", "image": "ubuntu"}],
        }),
    ] {
        let mut spec = pod_spec(existing);
        let original = spec.clone();
        handler
            .update_pod_spec("default", &BTreeMap::new(), &mut spec)
            .await
            .unwrap();
        assert_eq!(spec, original);
    }
}

#[tokio::test]
async fn test_registry_failure_leaves_the_pod_unmodified() {
    let handler = new_handler(Arc::new(RegistryFunc(|_secret: &str, _image: &str| {
        anyhow::bail!("registry unavailable")
    })));
    let mut spec = pod_spec(serde_json::json!({
        "containers": [{"name": "main", "image": "ubuntu"}],
    }));
    let original = spec.clone();

    handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap();
    assert_eq!(spec, original);
    assert_eq!(
        handler
            .metrics
            .registry_errors
            .with_label_values(&["ubuntu"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_match_node_labels_are_injected_even_when_skipping() {
    let handler = new_handler(static_registry(&[("ubuntu", &[("linux", "amd64")])]))
        .with_match_node_labels(vec!["accelerator".to_string()]);
    let labels = BTreeMap::from([("accelerator".to_string(), "gpu".to_string())]);
    let mut spec = pod_spec(serde_json::json!({
        "nodeSelector": {"kubernetes.io/arch": "amd64"},
        "containers": [{"name": "main", "image": "ubuntu"}],
    }));

    handler
        .update_pod_spec("default", &labels, &mut spec)
        .await
        .unwrap();
    assert_eq!(
        spec.node_selector.as_ref().unwrap().get("accelerator"),
        Some(&"gpu".to_string())
    );
}

#[tokio::test]
async fn test_match_node_labels_extend_the_affinity_without_a_node_selector() {
    let handler = new_handler(static_registry(&[("ubuntu", &[("linux", "amd64")])]))
        .with_match_node_labels(vec!["accelerator".to_string()]);
    let labels = BTreeMap::from([("accelerator".to_string(), "gpu".to_string())]);
    let mut spec = pod_spec(serde_json::json!({
        "containers": [{"name": "main", "image": "ubuntu"}],
    }));

    handler
        .update_pod_spec("default", &labels, &mut spec)
        .await
        .unwrap();
    let terms = &spec
        .affinity
        .as_ref()
        .unwrap()
        .node_affinity
        .as_ref()
        .unwrap()
        .required_during_scheduling_ignored_during_execution
        .as_ref()
        .unwrap()
        .node_selector_terms;
    assert!(terms.iter().any(|term| {
        term.match_expressions.as_ref().is_some_and(|expressions| {
            expressions
                .iter()
                .any(|e| e.key == "accelerator" && e.values == Some(vec!["gpu".to_string()]))
        })
    }));
}

#[tokio::test]
async fn test_filters_architectures_against_the_system_os() {
    let handler = new_handler(static_registry(&[(
        "windows-only",
        &[("windows", "amd64")],
    )]));
    let mut spec = pod_spec(serde_json::json!({
        "containers": [{"name": "main", "image": "windows-only"}],
    }));

    let err = handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("common image architecture"));
}

#[tokio::test]
async fn test_empty_os_platforms_match_any_system_os() {
    let handler = new_handler(static_registry(&[("ubuntu", &[("", "arm64")])]));
    let mut spec = pod_spec(serde_json::json!({
        "containers": [{"name": "main", "image": "ubuntu"}],
    }));

    handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap();
    assert_eq!(arch_affinity_values(&spec), Some(vec!["arm64".to_string()]));
}

#[tokio::test]
async fn test_pull_secrets_are_merged_and_forwarded_to_the_registry() {
    let secret: Secret = serde_json::from_value(serde_json::json!({
        "metadata": {"name": "regcred", "namespace": "default"},
        "data": {
            ".dockerconfigjson": base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                serde_json::json!({"auths": {"registry.example.com": {"auth": "c2VjcmV0"}}}).to_string(),
            ),
        },
    }))
    .unwrap();
    let client = Arc::new(
        FakeClusterClient::default().with_secret("default", "regcred", secret),
    );

    let seen_secrets = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorded = seen_secrets.clone();
    let registry = Arc::new(RegistryFunc(move |secret: &str, _image: &str| {
        recorded.lock().unwrap().push(secret.to_string());
        Ok(vec![Platform::new("amd64", "linux")])
    }));
    let handler = Handler::new(client, registry, &prometheus::Registry::new())
        .unwrap()
        .with_os("linux");

    let mut spec = pod_spec(serde_json::json!({
        "imagePullSecrets": [{"name": "regcred"}],
        "containers": [{"name": "main", "image": "registry.example.com/app"}],
    }));
    handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap();

    let seen = seen_secrets.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let cfg: DockerConfig = serde_json::from_str(&seen[0]).unwrap();
    assert_eq!(cfg.auths["registry.example.com"].auth, "c2VjcmV0");
}

#[tokio::test]
async fn test_missing_pull_secret_is_counted_but_not_fatal() {
    let handler = new_handler(static_registry(&[("ubuntu", &[("linux", "amd64")])]));
    let mut spec = pod_spec(serde_json::json!({
        "imagePullSecrets": [{"name": "missing"}],
        "containers": [{"name": "main", "image": "ubuntu"}],
    }));

    handler
        .update_pod_spec("default", &BTreeMap::new(), &mut spec)
        .await
        .unwrap();
    assert_eq!(
        handler
            .metrics
            .image_pull_secret_failed
            .with_label_values(&["default"])
            .get(),
        1
    );
    assert!(arch_affinity_values(&spec).is_some());
}

#[test]
fn test_parse_match_node_labels() {
    assert_eq!(
        parse_match_node_labels("accelerator, topology.kubernetes.io/zone"),
        vec![
            "accelerator".to_string(),
            "topology.kubernetes.io/zone".to_string(),
        ]
    );
    assert!(parse_match_node_labels("").is_empty());
}

fn admission_review(kind: &str, operation: &str, object: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "review-uid",
            "kind": {"group": "", "version": "v1", "kind": kind},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "operation": operation,
            "userInfo": {},
            "namespace": "default",
            "object": object,
            "dryRun": false,
        },
    })
}

#[tokio::test]
async fn test_handle_mutates_pod_creations() {
    let handler = new_handler(static_registry(&[(
        "ubuntu",
        &[("linux", "amd64"), ("linux", "arm64")],
    )]));
    let review = handler
        .handle(admission_review(
            "Pod",
            "CREATE",
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "web", "namespace": "default"},
                "spec": {"containers": [{"name": "main", "image": "ubuntu"}]},
            }),
        ))
        .await;

    let response = review.response.expect("expected a response");
    assert!(response.allowed);
    let patch = String::from_utf8(response.patch.expect("expected a patch")).unwrap();
    assert!(patch.contains("kubernetes.io/arch"));
}

#[tokio::test]
async fn test_handle_denies_pods_without_a_common_architecture() {
    let handler = new_handler(static_registry(&[
        ("arm-only", &[("linux", "arm64")]),
        ("amd-only", &[("linux", "amd64")]),
    ]));
    let review = handler
        .handle(admission_review(
            "Pod",
            "CREATE",
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "web", "namespace": "default"},
                "spec": {"containers": [
                    {"name": "a", "image": "arm-only"},
                    {"name": "b", "image": "amd-only"},
                ]},
            }),
        ))
        .await;

    let response = review.response.expect("expected a response");
    assert!(!response.allowed);
    let encoded = serde_json::to_string(&response).unwrap();
    assert!(encoded.contains("could not find a common image architecture"));
}

#[tokio::test]
async fn test_handle_surfaces_preference_warnings() {
    let handler = new_handler(static_registry(&[("ubuntu", &[("linux", "amd64")])]));
    let review = handler
        .handle(admission_review(
            "Pod",
            "CREATE",
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "web",
                    "namespace": "default",
                    "labels": {"arch.noe.adevinta.com/preferred": "arm64"},
                },
                "spec": {"containers": [{"name": "main", "image": "ubuntu"}]},
            }),
        ))
        .await;

    let response = review.response.expect("expected a response");
    assert!(response.allowed);
    assert_eq!(
        response.warnings,
        Some(vec!["could not select preferred arch: arm64".to_string()])
    );
    assert!(response.patch.is_some());
}

#[tokio::test]
async fn test_handle_skips_pod_updates() {
    let handler = new_handler(static_registry(&[("ubuntu", &[("linux", "arm64")])]));
    let review = handler
        .handle(admission_review(
            "Pod",
            "UPDATE",
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "web", "namespace": "default"},
                "spec": {"containers": [{"name": "main", "image": "ubuntu"}]},
            }),
        ))
        .await;

    let response = review.response.expect("expected a response");
    assert!(response.allowed);
    assert!(response.patch.is_none());
}

#[tokio::test]
async fn test_handle_passes_other_kinds_through() {
    let handler = new_handler(static_registry(&[]));
    let review = handler
        .handle(admission_review(
            "ConfigMap",
            "CREATE",
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cm", "namespace": "default"},
            }),
        ))
        .await;

    let response = review.response.expect("expected a response");
    assert!(response.allowed);
    assert!(response.patch.is_none());
}

#[tokio::test]
async fn test_handle_mutates_daemon_sets() {
    let handler = new_handler(static_registry(&[(
        "ubuntu",
        &[("linux", "amd64"), ("linux", "arm64")],
    )]));
    let review = handler
        .handle(admission_review(
            "DaemonSet",
            "CREATE",
            serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "DaemonSet",
                "metadata": {"name": "agent", "namespace": "default"},
                "spec": {
                    "selector": {"matchLabels": {"app": "agent"}},
                    "template": {
                        "metadata": {"labels": {"app": "agent"}},
                        "spec": {"containers": [{"name": "main", "image": "ubuntu"}]},
                    },
                },
            }),
        ))
        .await;

    let response = review.response.expect("expected a response");
    assert!(response.allowed);
    let patch = String::from_utf8(response.patch.expect("expected a patch")).unwrap();
    assert!(patch.contains("/spec/template/spec/affinity"));
}
