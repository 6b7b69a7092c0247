//! Fixtures shared by the controller tests

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::events::EventType;

use corral_common::crd::{Cluster, ClusterSpec};
use corral_common::events::EventPublisher;

/// One published event: (type, reason, action)
pub type RecordedEvent = (String, String, String);

/// Event publisher that remembers what it was asked to publish
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().expect("mutex should not be poisoned").clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|(t, _, _)| t == "Warning")
            .map(|(_, reason, _)| reason)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        _note: Option<String>,
    ) {
        self.events
            .lock()
            .expect("mutex should not be poisoned")
            .push((format!("{:?}", type_), reason.to_string(), action.to_string()));
    }
}

/// Captures every object handed to a mocked write
#[derive(Clone)]
pub struct WriteCapture<T> {
    writes: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> WriteCapture<T> {
    pub fn new() -> Self {
        Self {
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, value: T) {
        self.writes
            .lock()
            .expect("mutex should not be poisoned")
            .push(value);
    }

    pub fn all(&self) -> Vec<T> {
        self.writes
            .lock()
            .expect("mutex should not be poisoned")
            .clone()
    }

    pub fn last(&self) -> Option<T> {
        self.all().pop()
    }
}

/// A Cluster in namespace `default` carrying the given finalizers
pub fn sample_cluster(name: &str, finalizers: &[&str]) -> Cluster {
    Cluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            resource_version: Some("1".to_string()),
            finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
            ..Default::default()
        },
        spec: ClusterSpec::default(),
        status: None,
    }
}

/// Mark an object as being deleted
pub fn deletion_requested(meta: &mut ObjectMeta) {
    meta.deletion_timestamp = Some(Time(chrono::Utc::now()));
}
