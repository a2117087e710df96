//! Cluster lookups behind a trait so the reconciliation hooks and the
//! source resolver can be tested against an in-memory store.

use crate::controller::error::ReconcileError;
use crate::controller::source::flux::SourceKind;
use crate::crd::{Component, NamespacedName};
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::core::DynamicObject;
use kube::{Api, Client};
use std::collections::BTreeMap;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a flux source object by kind and name, `None` when absent.
    async fn get_source(
        &self,
        kind: SourceKind,
        name: &NamespacedName,
    ) -> Result<Option<DynamicObject>, ReconcileError>;

    /// Fetch a component by namespace and name, `None` when absent.
    async fn get_component(
        &self,
        name: &NamespacedName,
    ) -> Result<Option<Component>, ReconcileError>;

    /// All components whose declared dependencies reference the given
    /// `namespace/name` key.
    async fn list_dependents(&self, key: &str) -> Result<Vec<Component>, ReconcileError>;

    /// Fetch a secret's data entries, `None` when the secret is absent.
    async fn get_secret(
        &self,
        name: &NamespacedName,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ReconcileError>;
}

/// [`ObjectStore`] backed by the API server.
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        KubeObjectStore { client }
    }

    fn namespace_of<'a>(&self, name: &'a NamespacedName) -> Result<&'a str, ReconcileError> {
        name.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| ReconcileError::fatal(format!("reference {name} has no namespace")))
    }
}

/// Collapse 404s into `None`, keep everything else as a retriable API error.
fn absent_on_not_found<T>(
    result: Result<T, kube::Error>,
    what: &str,
) -> Result<Option<T>, ReconcileError> {
    match result {
        Ok(object) => Ok(Some(object)),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
        Err(err) => Err(ReconcileError::retriable(format!(
            "failed to get {what}: {err}"
        ))),
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get_source(
        &self,
        kind: SourceKind,
        name: &NamespacedName,
    ) -> Result<Option<DynamicObject>, ReconcileError> {
        let namespace = self.namespace_of(name)?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource());
        absent_on_not_found(api.get(&name.name).await, &format!("{kind} {name}"))
    }

    async fn get_component(
        &self,
        name: &NamespacedName,
    ) -> Result<Option<Component>, ReconcileError> {
        let namespace = self.namespace_of(name)?;
        let api: Api<Component> = Api::namespaced(self.client.clone(), namespace);
        absent_on_not_found(api.get(&name.name).await, &format!("component {name}"))
    }

    async fn list_dependents(&self, key: &str) -> Result<Vec<Component>, ReconcileError> {
        let api: Api<Component> = Api::all(self.client.clone());
        let components = api
            .list(&ListParams::default())
            .await
            .context("failed to list components")
            .map_err(|err| ReconcileError::retriable(format!("{err:#}")))?;
        Ok(components
            .items
            .into_iter()
            .filter(|component| component.dependency_keys().iter().any(|k| k == key))
            .collect())
    }

    async fn get_secret(
        &self,
        name: &NamespacedName,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ReconcileError> {
        let namespace = self.namespace_of(name)?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = absent_on_not_found(api.get(&name.name).await, &format!("secret {name}"))?;
        Ok(secret.map(|secret| {
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect()
        }))
    }
}
