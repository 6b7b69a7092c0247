//! Reconcile controllers for Cluster and Machine resources
//!
//! Each reconcile pass handles one object and dispatches at most one actuator
//! verb:
//!
//! ```text
//! deletion timestamp set ── finalizer present ──> delete, then release finalizer
//! no finalizer ──────────────────────────────────> add finalizer, requeue
//! exists ── true ──> update
//!        └─ false ─> create
//! ```
//!
//! Permanent actuator errors are written to `status.errorReason` /
//! `status.errorMessage` and emitted as Warning events; the pass then waits
//! for the spec to change. Retryable errors are returned to the runtime and
//! requeued by [`error_policy`] with per-object exponential backoff.

pub mod cluster;
pub mod machine;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

use corral_common::crd::ErrorReason;
use corral_common::events::{actions, reasons, EventPublisher};
use corral_common::Error;

use crate::client::KubeClient;

/// Finalizer guarding Cluster deletion
pub const CLUSTER_FINALIZER: &str = "cluster.cluster.k8s.io";

/// Finalizer guarding Machine deletion
pub const MACHINE_FINALIZER: &str = "machine.cluster.k8s.io";

/// Resync period for healthy objects
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// First requeue delay after a retryable error
pub const ERROR_REQUEUE_BASE: Duration = Duration::from_secs(5);

/// Largest requeue delay after repeated errors
pub const ERROR_REQUEUE_MAX: Duration = Duration::from_secs(300);

/// Actuator verb dispatched by a reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    /// Provision
    Create,
    /// Converge drift
    Update,
    /// Tear down
    Delete,
}

impl Verb {
    /// Lowercase name for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }

    /// Event action for this verb
    pub fn action(&self) -> &'static str {
        match self {
            Verb::Create => actions::CREATE,
            Verb::Update => actions::UPDATE,
            Verb::Delete => actions::DELETE,
        }
    }

    /// Status reason for a permanent failure of this verb
    pub fn error_reason(&self, error: &Error) -> ErrorReason {
        if error.is_configuration_error() {
            return ErrorReason::InvalidConfiguration;
        }
        if matches!(error, Error::Unsupported { .. }) {
            return ErrorReason::UnsupportedChange;
        }
        match self {
            Verb::Create => ErrorReason::CreateError,
            Verb::Update => ErrorReason::UpdateError,
            Verb::Delete => ErrorReason::DeleteError,
        }
    }
}

/// Event reason matching a status error reason
pub fn event_reason(reason: ErrorReason) -> &'static str {
    match reason {
        ErrorReason::InvalidConfiguration => reasons::INVALID_CONFIGURATION,
        ErrorReason::UnsupportedChange => reasons::UNSUPPORTED_CHANGE,
        _ => reasons::RECONCILE_FAILED,
    }
}

/// Failure counts older than this belong to objects no longer requeued
pub const ERROR_BACKOFF_EXPIRY: Duration = Duration::from_secs(600);

/// Per-object count of consecutive failed passes
///
/// A failing object is requeued at least every [`ERROR_REQUEUE_MAX`], so an
/// entry untouched for [`ERROR_BACKOFF_EXPIRY`] belongs to an object that was
/// removed while failing and is pruned on the next failure.
#[derive(Default)]
pub struct ErrorBackoff {
    failures: DashMap<String, (u32, Instant)>,
}

impl ErrorBackoff {
    /// Record a failure and return how long to wait before the next pass
    pub fn next_delay(&self, key: &str) -> Duration {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, last)| now.duration_since(*last) < ERROR_BACKOFF_EXPIRY);

        let mut entry = self
            .failures
            .entry(key.to_string())
            .or_insert((0, now));
        let (count, last) = entry.value_mut();
        *count = count.saturating_add(1);
        *last = now;
        let exponent = (*count - 1).min(16);
        ERROR_REQUEUE_BASE
            .saturating_mul(1u32 << exponent)
            .min(ERROR_REQUEUE_MAX)
    }

    /// Forget failures after a successful pass
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Number of objects with recorded failures
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}

/// Shared state for one controller
///
/// `A` is the actuator trait object (`dyn ClusterActuator` or `dyn MachineActuator`).
pub struct Context<A: ?Sized> {
    /// Kubernetes client for reads and writes (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Provider actuator
    pub actuator: Arc<A>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Cancelled on shutdown; each pass works under a child token
    pub shutdown: CancellationToken,
    /// Requeue backoff bookkeeping
    pub backoff: ErrorBackoff,
}

impl<A: ?Sized> Context<A> {
    /// Build a context
    pub fn new(
        kube: Arc<dyn KubeClient>,
        actuator: Arc<A>,
        events: Arc<dyn EventPublisher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            kube,
            actuator,
            events,
            shutdown,
            backoff: ErrorBackoff::default(),
        }
    }
}

/// `namespace/name` of an object
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Whether the object carries the given finalizer
pub fn has_finalizer<K: ResourceExt>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Add a finalizer in place; returns whether anything changed
pub fn add_finalizer<K: ResourceExt>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.finalizers_mut().push(finalizer.to_string());
    true
}

/// Remove a finalizer in place; returns whether anything changed
pub fn remove_finalizer<K: ResourceExt>(obj: &mut K, finalizer: &str) -> bool {
    let before = obj.finalizers().len();
    obj.finalizers_mut().retain(|f| f != finalizer);
    before != obj.finalizers().len()
}

/// Error policy shared by both controllers
///
/// Logs the failure and requeues with exponential backoff per object.
pub fn error_policy<K, A>(obj: Arc<K>, error: &Error, ctx: Arc<Context<A>>) -> Action
where
    K: Resource<DynamicType = ()> + ResourceExt,
    A: ?Sized,
{
    let key = object_key(obj.as_ref());
    let delay = ctx.backoff.next_delay(&key);
    error!(
        ?error,
        kind = %K::kind(&()),
        object = %key,
        retryable = error.is_retryable(),
        requeue_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_common::crd::{Cluster, ClusterSpec};

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = ErrorBackoff::default();
        assert_eq!(backoff.next_delay("ns/a"), Duration::from_secs(5));
        assert_eq!(backoff.next_delay("ns/a"), Duration::from_secs(10));
        assert_eq!(backoff.next_delay("ns/a"), Duration::from_secs(20));
        for _ in 0..10 {
            backoff.next_delay("ns/a");
        }
        assert_eq!(backoff.next_delay("ns/a"), ERROR_REQUEUE_MAX);

        assert_eq!(backoff.next_delay("ns/b"), Duration::from_secs(5));
        backoff.reset("ns/a");
        assert_eq!(backoff.next_delay("ns/a"), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_forgets_objects_that_stopped_failing() {
        let backoff = ErrorBackoff::default();
        backoff.next_delay("ns/removed");
        backoff.next_delay("ns/removed");
        assert_eq!(backoff.tracked(), 1);

        tokio::time::advance(ERROR_BACKOFF_EXPIRY + Duration::from_secs(1)).await;
        assert_eq!(backoff.next_delay("ns/other"), ERROR_REQUEUE_BASE);
        assert_eq!(backoff.tracked(), 1);
        assert_eq!(backoff.next_delay("ns/removed"), ERROR_REQUEUE_BASE);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_keeps_objects_still_requeued() {
        let backoff = ErrorBackoff::default();
        backoff.next_delay("ns/a");
        tokio::time::advance(ERROR_REQUEUE_MAX).await;
        assert_eq!(backoff.next_delay("ns/a"), Duration::from_secs(10));
    }

    #[test]
    fn finalizer_helpers_are_idempotent() {
        let mut cluster = Cluster::new("c", ClusterSpec::default());
        assert!(add_finalizer(&mut cluster, CLUSTER_FINALIZER));
        assert!(!add_finalizer(&mut cluster, CLUSTER_FINALIZER));
        assert!(has_finalizer(&cluster, CLUSTER_FINALIZER));
        assert!(remove_finalizer(&mut cluster, CLUSTER_FINALIZER));
        assert!(!remove_finalizer(&mut cluster, CLUSTER_FINALIZER));
    }

    #[test]
    fn error_reasons_prefer_error_class_over_verb() {
        let decode = Error::decode("ns/c", "bad kind");
        let unsupported = Error::unsupported("ns/c", "update", "nope");
        let failed = Error::operation_failed("op-1", "QUOTA_EXCEEDED");

        assert_eq!(Verb::Update.error_reason(&decode), ErrorReason::InvalidConfiguration);
        assert_eq!(Verb::Update.error_reason(&unsupported), ErrorReason::UnsupportedChange);
        assert_eq!(Verb::Create.error_reason(&failed), ErrorReason::CreateError);
        assert_eq!(Verb::Delete.error_reason(&failed), ErrorReason::DeleteError);
    }
}
