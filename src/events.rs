//! Deterministic-name event upserts
//!
//! Events share a name derived from their owner and a suffix, so repeated
//! occurrences coalesce into one event whose count and message grow instead
//! of flooding the namespace.

use crate::kubeapi::ClusterClient;
use k8s_openapi::api::core::v1::{EventSource, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use tracing::{error, trace};

/// The object an event is attached to.
#[derive(Debug, Clone)]
pub struct EventOwner {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl EventOwner {
    pub fn for_pod(pod: &Pod) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            uid: pod.metadata.uid.clone().unwrap_or_default(),
        }
    }

    /// Owners of the pod that are marked as its controller.
    pub fn controllers_of_pod(pod: &Pod) -> Vec<Self> {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        pod.metadata
            .owner_references
            .iter()
            .flatten()
            .filter(|reference| reference.controller.unwrap_or(false))
            .map(|reference| Self {
                api_version: reference.api_version.clone(),
                kind: reference.kind.clone(),
                namespace: namespace.clone(),
                name: reference.name.clone(),
                uid: reference.uid.clone(),
            })
            .collect()
    }
}

/// Creates or updates the event named `<owner>-<suffix>`: the message prefix
/// is set once, the detail line is appended on every occurrence, and the
/// count and series bookkeeping are refreshed.
pub async fn upsert_event(
    client: &dyn ClusterClient,
    owner: &EventOwner,
    event_type: &str,
    reason: &str,
    name_suffix: &str,
    message_prefix: &str,
    detail: &str,
) {
    let name = format!("{}-{}", owner.name, name_suffix);
    let existing = match client.get_event(&owner.namespace, &name).await {
        Ok(existing) => existing,
        Err(err) => {
            error!(event = name.as_str(), error = %err, "failed to look up event");
            return;
        }
    };
    let exists = existing.is_some();
    let mut event = existing.unwrap_or_default();
    event.metadata.namespace = Some(owner.namespace.clone());
    event.metadata.name = Some(name.clone());

    if event.message.as_deref().unwrap_or("").is_empty() {
        event.message = Some(message_prefix.to_string());
    }
    event.message = event.message.map(|message| format!("{}\n{}", message, detail));
    event.type_ = Some(event_type.to_string());
    event.reason = Some(reason.to_string());
    event.count = Some(event.count.unwrap_or(0) + 1);
    let now = chrono::Utc::now();
    let mut series = event.series.take().unwrap_or_default();
    series.count = Some(series.count.unwrap_or(0) + 1);
    series.last_observed_time = Some(MicroTime(now));
    event.series = Some(series);
    event.source = Some(EventSource {
        component: Some("noe".to_string()),
        ..Default::default()
    });
    event.last_timestamp = Some(Time(now));
    if event.first_timestamp.is_none() {
        event.first_timestamp = Some(Time(now));
    }
    event.involved_object = ObjectReference {
        api_version: Some(owner.api_version.clone()),
        kind: Some(owner.kind.clone()),
        name: Some(owner.name.clone()),
        namespace: Some(owner.namespace.clone()),
        uid: Some(owner.uid.clone()),
        ..Default::default()
    };

    let result = if exists {
        client.replace_event(&owner.namespace, &name, &event).await
    } else {
        client.create_event(&owner.namespace, &event).await
    };
    match result {
        Ok(()) => trace!(event = name.as_str(), "upserted event"),
        Err(err) => error!(event = name.as_str(), error = %err, "failed to upsert event"),
    }
}
