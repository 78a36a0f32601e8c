//! Pod event consumer
//!
//! Drains the pod event stream for the whole process lifetime. The stream
//! ending or failing is fatal to the caller: a registry that silently stops
//! following the node is worse than a restarted controller.

use crate::context::AppContext;
use crate::health::components;
use crate::models::{PodEvent, PodEventKind};
use crate::orchestrator::{OrchestratorError, PodEventStream};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("pod event stream failed: {0}")]
    Stream(#[from] OrchestratorError),

    #[error("pod event stream ended")]
    Ended,
}

/// What an event did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Pod is scheduled on another node
    OtherNode,
    /// Nothing to do (no containers yet, or an untracked pod went away)
    Ignored,
    /// Pod started being tracked and its containers were reconciled
    Added,
    /// Tracked pod's containers were reconciled
    Modified,
    /// Pod stopped being tracked
    Deleted,
}

/// Apply one pod event to the registry
pub async fn handle_event(ctx: &AppContext, event: &PodEvent) -> EventOutcome {
    let object = &event.object;
    let key = object.key();
    let registry = &ctx.registry;

    if object.is_qos_tracked() {
        match event.kind {
            PodEventKind::Added | PodEventKind::Modified if object.is_terminated() => {
                registry.clear_qos_app(&key).await;
            }
            PodEventKind::Added | PodEventKind::Modified => {
                if let Some(status) = object.container_statuses.first() {
                    registry.set_qos_app(&key, &status.name).await;
                }
            }
            PodEventKind::Deleted => {
                registry.clear_qos_app(&key).await;
            }
        }
    }

    if object.node_name.as_deref() != Some(ctx.node.name.as_str()) {
        return EventOutcome::OtherNode;
    }

    let tracked = registry.contains(&key).await;
    let live = matches!(event.kind, PodEventKind::Added | PodEventKind::Modified)
        && !object.is_terminated();
    let mut outcome = EventOutcome::Ignored;

    if live && object.has_containers() {
        if tracked && event.kind == PodEventKind::Added {
            warn!(subsystem = "watch", pod = %key, "Duplicate ADD for tracked pod, reconciling");
        }
        if !tracked {
            match registry.add_pod(&key, object).await {
                Ok(()) => outcome = EventOutcome::Added,
                Err(e) => warn!(subsystem = "watch", pod = %key, error = %e, "Add failed"),
            }
        }

        match registry
            .modify_pod(&key, object, ctx.runtime.as_ref(), ctx.admission_clamp())
            .await
        {
            Ok(changes) => {
                if outcome != EventOutcome::Added {
                    outcome = EventOutcome::Modified;
                }
                debug!(
                    pod = %key,
                    added = changes.added,
                    removed = changes.removed,
                    skipped = changes.skipped,
                    "Pod reconciled"
                );
            }
            Err(e) => warn!(subsystem = "watch", pod = %key, error = %e, "Modify failed"),
        }
    }

    let gone = event.kind == PodEventKind::Deleted || object.is_terminated();
    if gone && tracked {
        match registry.delete_pod(&key).await {
            Ok(_) => outcome = EventOutcome::Deleted,
            Err(e) => warn!(subsystem = "watch", pod = %key, error = %e, "Delete failed"),
        }
    }

    if outcome != EventOutcome::Ignored {
        let (hp, be) = registry.pod_counts().await;
        ctx.metrics.set_pod_counts(hp as i64, be as i64);
    }

    outcome
}

/// Consume pod events until the stream ends, fails, or shutdown is signalled.
///
/// Returns `Ok(())` only on shutdown.
pub async fn run_pod_watch(
    ctx: &AppContext,
    mut events: PodEventStream,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), WatchError> {
    info!(node = %ctx.node.name, mode = ctx.mode.name(), "Starting pod event consumer");
    ctx.health.set_healthy(components::WATCHER).await;

    loop {
        tokio::select! {
            next = events.next() => {
                match next {
                    Some(Ok(event)) => {
                        let outcome = handle_event(ctx, &event).await;
                        debug!(
                            kind = ?event.kind,
                            pod = %event.object.key(),
                            outcome = ?outcome,
                            "Pod event handled"
                        );
                    }
                    Some(Err(e)) => {
                        error!(subsystem = "watch", error = %e, "Pod event stream failed");
                        ctx.health.set_unhealthy(components::WATCHER, e.to_string()).await;
                        return Err(WatchError::Stream(e));
                    }
                    None => {
                        error!(subsystem = "watch", "Pod event stream ended");
                        ctx.health.set_unhealthy(components::WATCHER, "event stream ended").await;
                        return Err(WatchError::Ended);
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down pod event consumer");
                return Ok(());
            }
        }
    }
}
