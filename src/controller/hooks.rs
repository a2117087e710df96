//! Reconciliation hooks around the apply step: source resolution with the
//! optional revision pin, the dependency gate before reconcile and delete,
//! and the status stamps that make sibling components sharing one source
//! advance together.

use crate::controller::error::ReconcileError;
use crate::controller::source::{self, ResolvedSource};
use crate::controller::store::ObjectStore;
use crate::crd::{Component, ComponentStatus};
use std::time::Duration;
use tracing::debug;

const REVISION_PIN_DELAY: Duration = Duration::from_secs(10);

/// Resolve the component's source and enforce the optional revision pin.
pub async fn post_read(
    store: &dyn ObjectStore,
    head_client: &reqwest::Client,
    component: &Component,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<ResolvedSource, ReconcileError> {
    let resolved = source::resolve(store, head_client, component, now).await?;
    if let Some(pin) = &component.spec.revision {
        if &resolved.artifact.revision != pin {
            return Err(ReconcileError::retriable_after(
                format!(
                    "source is at revision {:?}, waiting for pinned revision {pin:?}",
                    resolved.artifact.revision
                ),
                REVISION_PIN_DELAY,
            ));
        }
    }
    Ok(resolved)
}

/// Record the attempt on the component's status. Must be persisted before
/// the dependency gate runs so that siblings sharing this source observe the
/// fresh attempt.
pub fn stamp_attempt(status: &mut ComponentStatus, resolved: &ResolvedSource) {
    status.last_attempted_digest = Some(resolved.artifact.digest.clone());
    status.last_attempted_revision = Some(resolved.artifact.revision.clone());
    status.source_ref = Some(resolved.clone().into());
}

/// Promote the attempted digest/revision to applied after a successful
/// reconciliation.
pub fn stamp_applied(status: &mut ComponentStatus) {
    status.last_applied_digest = status.last_attempted_digest.clone();
    status.last_applied_revision = status.last_attempted_revision.clone();
}

/// Gate one reconciliation attempt on the component's declared dependencies.
/// Expects the attempt to have been stamped (and persisted) already.
pub async fn pre_reconcile(
    store: &dyn ObjectStore,
    component: &Component,
    resolved: &ResolvedSource,
) -> Result<(), ReconcileError> {
    let namespace = component.metadata.namespace.as_deref().unwrap_or_default();
    for dependency in &component.spec.dependencies {
        let name = dependency.name.with_default_namespace(namespace);
        let Some(dependency) = store.get_component(&name).await? else {
            return Err(ReconcileError::retriable(format!(
                "dependency {name} not found"
            )));
        };

        // A dependency sharing this component's source must have picked up
        // the same snapshot before this component proceeds.
        if dependency.spec.source_ref == component.spec.source_ref {
            let status = dependency.status.clone().unwrap_or_default();
            let synced = status.last_attempted_digest.as_deref()
                == Some(resolved.artifact.digest.as_str())
                && status.last_attempted_revision.as_deref()
                    == Some(resolved.artifact.revision.as_str());
            if !synced {
                return Err(ReconcileError::retriable(format!(
                    "dependency {name} is not synced with the current source revision"
                )));
            }
        }

        if !dependency.is_ready() {
            return Err(ReconcileError::retriable(format!(
                "dependency {name} is not ready"
            )));
        }
        debug!(dependency = %name, "dependency is ready");
    }
    Ok(())
}

/// Block deletion while other components still depend on this one.
pub async fn pre_delete(
    store: &dyn ObjectStore,
    component: &Component,
) -> Result<(), ReconcileError> {
    let key = component.namespaced_name().to_string();
    let dependents = store.list_dependents(&key).await?;
    let Some(first) = dependents.first() else {
        return Ok(());
    };
    let mut message = format!(
        "deletion blocked by depending component {}",
        first.namespaced_name()
    );
    if dependents.len() > 1 {
        message.push_str(&format!(" (and {} others)", dependents.len() - 1));
    }
    Err(ReconcileError::retriable(message))
}
