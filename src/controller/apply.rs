//! Server-side apply of the assembled object list.

use crate::controller::error::ReconcileError;
use anyhow::Context;
use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::{Api, Client};
use std::str::FromStr;
use tracing::debug;

pub const FIELD_MANAGER: &str = "component-controller";

#[async_trait]
pub trait Applier: Send + Sync {
    /// Apply the objects, defaulting namespaced objects without an explicit
    /// namespace into `default_namespace`.
    async fn apply(
        &self,
        default_namespace: &str,
        objects: &[DynamicObject],
    ) -> Result<(), ReconcileError>;
}

/// [`Applier`] using server-side apply with a forcing field manager, so the
/// controller owns the fields it renders.
pub struct ServerSideApplier {
    client: Client,
}

impl ServerSideApplier {
    pub fn new(client: Client) -> Self {
        ServerSideApplier { client }
    }
}

fn gvk_of(object: &DynamicObject) -> Result<GroupVersionKind, ReconcileError> {
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| ReconcileError::fatal("rendered object has no apiVersion/kind"))?;
    let group_version = kube::core::GroupVersion::from_str(&types.api_version)
        .with_context(|| format!("invalid apiVersion {:?}", types.api_version))
        .map_err(ReconcileError::Fatal)?;
    Ok(group_version.with_kind(&types.kind))
}

#[async_trait]
impl Applier for ServerSideApplier {
    async fn apply(
        &self,
        default_namespace: &str,
        objects: &[DynamicObject],
    ) -> Result<(), ReconcileError> {
        if objects.is_empty() {
            return Ok(());
        }
        // Fresh discovery per batch, so kinds introduced by earlier
        // reconciliations (e.g. CRDs) resolve on the next pass.
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|err| ReconcileError::retriable(format!("api discovery failed: {err}")))?;

        let params = PatchParams::apply(FIELD_MANAGER).force();
        for object in objects {
            let gvk = gvk_of(object)?;
            let name = object.metadata.name.clone().ok_or_else(|| {
                ReconcileError::fatal(format!("rendered {} object has no name", gvk.kind))
            })?;

            let (resource, capabilities) = discovery.resolve_gvk(&gvk).ok_or_else(|| {
                ReconcileError::retriable(format!(
                    "unknown resource type {}/{}",
                    gvk.api_version(),
                    gvk.kind
                ))
            })?;
            let api: Api<DynamicObject> = if capabilities.scope == Scope::Cluster {
                Api::all_with(self.client.clone(), &resource)
            } else {
                let namespace = object
                    .metadata
                    .namespace
                    .as_deref()
                    .unwrap_or(default_namespace);
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            };

            api.patch(&name, &params, &Patch::Apply(object))
                .await
                .with_context(|| format!("failed to apply {} {name}", gvk.kind))
                .map_err(|err| ReconcileError::retriable(format!("{err:#}")))?;
            debug!(kind = %gvk.kind, name = %name, "applied object");
        }
        Ok(())
    }
}
