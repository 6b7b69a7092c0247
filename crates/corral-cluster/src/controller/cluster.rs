//! Cluster controller

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use corral_common::crd::{
    set_condition, Cluster, ClusterStatus, Condition, ConditionStatus,
};
use corral_common::events::reasons;
use corral_common::metrics::{self, ReconcileTimer};
use corral_common::Error;

use super::{
    add_finalizer, event_reason, has_finalizer, object_key, remove_finalizer, Context, Verb,
    CLUSTER_FINALIZER, RESYNC_INTERVAL,
};
use crate::actuator::ClusterActuator;

/// Context for the Cluster controller
pub type ClusterContext = Context<dyn ClusterActuator>;

/// Reconcile one Cluster
#[instrument(skip(cluster, ctx), fields(cluster = %object_key(cluster.as_ref())))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<ClusterContext>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start("Cluster");
    let result = reconcile_cluster(&cluster, &ctx).await;
    match &result {
        Ok(_) => {
            ctx.backoff.reset(&object_key(cluster.as_ref()));
            timer.success();
        }
        Err(e) => timer.error(e.class()),
    }
    result
}

async fn reconcile_cluster(cluster: &Cluster, ctx: &ClusterContext) -> Result<Action, Error> {
    let cancel = ctx.shutdown.child_token();

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(cluster, ctx, &cancel).await;
    }

    if !has_finalizer(cluster, CLUSTER_FINALIZER) {
        info!("Adding finalizer");
        let mut updated = cluster.clone();
        add_finalizer(&mut updated, CLUSTER_FINALIZER);
        ctx.kube.replace_cluster(&updated).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let exists = match ctx.actuator.exists(cluster).await {
        Ok(exists) => exists,
        Err(e) if e.is_permanent() => return record_failure(cluster, ctx, Verb::Create, e).await,
        Err(e) => return Err(e),
    };

    let verb = if exists { Verb::Update } else { Verb::Create };
    info!(verb = verb.as_str(), "dispatching to actuator");
    metrics::record_actuator_call("Cluster", verb.as_str());

    let result = if exists {
        ctx.actuator.update(cluster, &cancel).await
    } else {
        let namespace = cluster.namespace().unwrap_or_default();
        let machines = ctx
            .kube
            .list_cluster_machines(&namespace, &cluster.name_any())
            .await?;
        ctx.actuator.create(cluster, &machines, &cancel).await
    };

    match result {
        Ok(()) => {
            record_success(cluster, ctx, verb).await?;
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        Err(e) if e.is_permanent() => record_failure(cluster, ctx, verb, e).await,
        Err(e) => Err(e),
    }
}

async fn handle_deletion(
    cluster: &Cluster,
    ctx: &ClusterContext,
    cancel: &CancellationToken,
) -> Result<Action, Error> {
    if !has_finalizer(cluster, CLUSTER_FINALIZER) {
        return Ok(Action::await_change());
    }

    info!("Deleting cluster infrastructure");
    metrics::record_actuator_call("Cluster", Verb::Delete.as_str());
    match ctx.actuator.delete(cluster, cancel).await {
        Ok(()) => {}
        Err(e) if e.is_permanent() => return record_failure(cluster, ctx, Verb::Delete, e).await,
        Err(e) => return Err(e),
    }

    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Normal,
            reasons::DELETED,
            Verb::Delete.action(),
            None,
        )
        .await;

    // Re-read: the actuator may have written the object since it was delivered.
    let namespace = cluster.namespace().unwrap_or_default();
    if let Some(mut latest) = ctx.kube.get_cluster(&namespace, &cluster.name_any()).await? {
        if remove_finalizer(&mut latest, CLUSTER_FINALIZER) {
            ctx.kube.replace_cluster(&latest).await?;
            info!("Finalizer removed");
        }
    }

    Ok(Action::await_change())
}

/// Apply `mutate` to the stored status; returns whether a write happened
async fn update_status(
    cluster: &Cluster,
    ctx: &ClusterContext,
    mutate: impl FnOnce(&mut ClusterStatus),
) -> Result<bool, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let Some(mut latest) = ctx.kube.get_cluster(&namespace, &cluster.name_any()).await? else {
        return Ok(false);
    };

    let before = latest.status.clone();
    mutate(latest.status.get_or_insert_with(ClusterStatus::default));
    if latest.status == before {
        return Ok(false);
    }

    ctx.kube.replace_cluster_status(&latest).await?;
    Ok(true)
}

async fn record_success(cluster: &Cluster, ctx: &ClusterContext, verb: Verb) -> Result<(), Error> {
    let reason = match verb {
        Verb::Create => reasons::CREATED,
        _ => reasons::UPDATED,
    };

    let changed = update_status(cluster, ctx, |status| {
        status.error_reason = None;
        status.error_message = None;
        set_condition(
            &mut status.conditions,
            Condition::new("Ready", ConditionStatus::True, reason, "infrastructure provisioned"),
        );
    })
    .await?;

    if changed && verb == Verb::Create {
        ctx.events
            .publish(
                &cluster.object_ref(&()),
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
    cluster: &Cluster,
    ctx: &ClusterContext,
    verb: Verb,
    error: Error,
) -> Result<Action, Error> {
    let reason = verb.error_reason(&error);
    let message = error.to_string();
    warn!(verb = verb.as_str(), %reason, error = %message, "permanent failure, waiting for spec change");
    metrics::record_reconcile_error("Cluster", error.class());

    let changed = update_status(cluster, ctx, |status| {
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
                &cluster.object_ref(&()),
                EventType::Warning,
                event_reason(reason),
                verb.action(),
                Some(message),
            )
            .await;
    }

    Ok(Action::await_change())
}
