//! Machine controller
//!
//! Same dispatch as the Cluster controller, plus resolution of the owning
//! Cluster: the `cluster.k8s.io/cluster-name` label if set, otherwise the only
//! Cluster in the namespace.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use corral_common::crd::{
    set_condition, Cluster, Condition, ConditionStatus, Machine, MachineStatus, CLUSTER_NAME_LABEL,
};
use corral_common::events::reasons;
use corral_common::metrics::{self, ReconcileTimer};
use corral_common::Error;

use super::{
    add_finalizer, event_reason, has_finalizer, object_key, remove_finalizer, Context, Verb,
    MACHINE_FINALIZER, RESYNC_INTERVAL,
};
use crate::actuator::MachineActuator;

/// Context for the Machine controller
pub type MachineContext = Context<dyn MachineActuator>;

/// Requeue delay while the owning Cluster does not exist yet
pub const MISSING_CLUSTER_REQUEUE: Duration = Duration::from_secs(30);

/// Reconcile one Machine
#[instrument(skip(machine, ctx), fields(machine = %object_key(machine.as_ref())))]
pub async fn reconcile(machine: Arc<Machine>, ctx: Arc<MachineContext>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start("Machine");
    let result = reconcile_machine(&machine, &ctx).await;
    match &result {
        Ok(_) => {
            ctx.backoff.reset(&object_key(machine.as_ref()));
            timer.success();
        }
        Err(e) => timer.error(e.class()),
    }
    result
}

async fn reconcile_machine(machine: &Machine, ctx: &MachineContext) -> Result<Action, Error> {
    let cancel = ctx.shutdown.child_token();

    let resolved = resolve_cluster(machine, ctx).await;

    if machine.metadata.deletion_timestamp.is_some() {
        // Delete works from the recorded location without a cluster.
        let cluster = match resolved {
            Ok(cluster) => cluster,
            Err(e) if e.is_permanent() => {
                warn!(error = %e, "owning cluster unresolvable, deleting from recorded location");
                None
            }
            Err(e) => return Err(e),
        };
        return handle_deletion(machine, cluster.as_ref(), ctx, &cancel).await;
    }

    let cluster = match resolved {
        Ok(cluster) => cluster,
        Err(e) if e.is_permanent() => return record_failure(machine, ctx, Verb::Create, e).await,
        Err(e) => return Err(e),
    };

    if !has_finalizer(machine, MACHINE_FINALIZER) {
        info!("Adding finalizer");
        let mut updated = machine.clone();
        add_finalizer(&mut updated, MACHINE_FINALIZER);
        ctx.kube.replace_machine(&updated).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let Some(cluster) = cluster else {
        warn!("owning cluster not found, waiting for it");
        return Ok(Action::requeue(MISSING_CLUSTER_REQUEUE));
    };

    let exists = match ctx.actuator.exists(&cluster, machine).await {
        Ok(exists) => exists,
        Err(e) if e.is_permanent() => return record_failure(machine, ctx, Verb::Create, e).await,
        Err(e) => return Err(e),
    };

    let verb = if exists { Verb::Update } else { Verb::Create };
    info!(verb = verb.as_str(), cluster = %cluster.name_any(), "dispatching to actuator");
    metrics::record_actuator_call("Machine", verb.as_str());

    let result = if exists {
        ctx.actuator.update(&cluster, machine, &cancel).await
    } else {
        ctx.actuator.create(&cluster, machine, &cancel).await
    };

    match result {
        Ok(()) => {
            record_success(machine, ctx, verb).await?;
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        Err(e) if e.is_permanent() => record_failure(machine, ctx, verb, e).await,
        Err(e) => Err(e),
    }
}

/// Find the Cluster a Machine belongs to; `None` if it does not exist
async fn resolve_cluster(machine: &Machine, ctx: &MachineContext) -> Result<Option<Cluster>, Error> {
    let namespace = machine.namespace().unwrap_or_default();

    if let Some(name) = machine.labels().get(CLUSTER_NAME_LABEL) {
        return ctx.kube.get_cluster(&namespace, name).await;
    }

    let mut clusters = ctx.kube.list_clusters(&namespace).await?;
    match clusters.len() {
        0 => Ok(None),
        1 => Ok(clusters.pop()),
        n => Err(Error::validation_for_field(
            object_key(machine),
            format!("metadata.labels[{CLUSTER_NAME_LABEL}]"),
            format!("label is required when the namespace has {n} clusters"),
        )),
    }
}

async fn handle_deletion(
    machine: &Machine,
    cluster: Option<&Cluster>,
    ctx: &MachineContext,
    cancel: &CancellationToken,
) -> Result<Action, Error> {
    if !has_finalizer(machine, MACHINE_FINALIZER) {
        return Ok(Action::await_change());
    }

    info!(cluster_present = cluster.is_some(), "Deleting machine instance");
    metrics::record_actuator_call("Machine", Verb::Delete.as_str());
    match ctx.actuator.delete(cluster, machine, cancel).await {
        Ok(()) => {}
        Err(e) if e.is_permanent() => return record_failure(machine, ctx, Verb::Delete, e).await,
        Err(e) => return Err(e),
    }

    ctx.events
        .publish(
            &machine.object_ref(&()),
            EventType::Normal,
            reasons::DELETED,
            Verb::Delete.action(),
            None,
        )
        .await;

    let namespace = machine.namespace().unwrap_or_default();
    if let Some(mut latest) = ctx.kube.get_machine(&namespace, &machine.name_any()).await? {
        if remove_finalizer(&mut latest, MACHINE_FINALIZER) {
            ctx.kube.replace_machine(&latest).await?;
            info!("Finalizer removed");
        }
    }

    Ok(Action::await_change())
}

/// Apply `mutate` to the stored status; returns whether a write happened
async fn update_status(
    machine: &Machine,
    ctx: &MachineContext,
    mutate: impl FnOnce(&mut MachineStatus),
) -> Result<bool, Error> {
    let namespace = machine.namespace().unwrap_or_default();
    let Some(mut latest) = ctx.kube.get_machine(&namespace, &machine.name_any()).await? else {
        return Ok(false);
    };

    let before = latest.status.clone();
    let status = latest.status.get_or_insert_with(MachineStatus::default);
    mutate(status);
    if latest.status == before {
        return Ok(false);
    }
    if let Some(status) = latest.status.as_mut() {
        status.last_updated = Some(Utc::now());
    }

    ctx.kube.replace_machine_status(&latest).await?;
    Ok(true)
}

async fn record_success(machine: &Machine, ctx: &MachineContext, verb: Verb) -> Result<(), Error> {
    let reason = match verb {
        Verb::Create => reasons::INSTANCE_CREATED,
        _ => reasons::UPDATED,
    };

    let changed = update_status(machine, ctx, |status| {
        status.error_reason = None;
        status.error_message = None;
        set_condition(
            &mut status.conditions,
            Condition::new("Ready", ConditionStatus::True, reason, "instance provisioned"),
        );
    })
    .await?;

    if changed && verb == Verb::Create {
        ctx.events
            .publish(
                &machine.object_ref(&()),
                EventType::Normal,
                reason,
                verb.action(),
                None,
            )
            .await;
    }
    Ok(())
}

async fn record_failure(
    machine: &Machine,
    ctx: &MachineContext,
    verb: Verb,
    error: Error,
) -> Result<Action, Error> {
    let reason = verb.error_reason(&error);
    let message = error.to_string();
    warn!(verb = verb.as_str(), %reason, error = %message, "permanent failure, waiting for spec change");
    metrics::record_reconcile_error("Machine", error.class());

    let changed = update_status(machine, ctx, |status| {
        status.error_reason = Some(reason);
        status.error_message = Some(message.clone());
        set_condition(
            &mut status.conditions,
            Condition::new("Ready", ConditionStatus::False, reason.to_string(), message.clone()),
        );
    })
    .await?;

    if changed {
        ctx.events
            .publish(
                &machine.object_ref(&()),
                EventType::Warning,
                event_reason(reason),
                verb.action(),
                Some(message),
            )
            .await;
    }

    Ok(Action::await_change())
}
