//! # Source Resolution
//!
//! Resolves a component's source reference into a content-identified
//! [`Artifact`] plus a digest over the discriminating fields of the source.
//! HTTP repositories are probed with HEAD requests, flux sources are looked
//! up in the cluster.

pub mod flux;
pub mod http;

use crate::controller::error::ReconcileError;
use crate::controller::store::ObjectStore;
use crate::crd::{Component, SourceReference, SourceReferenceStatus};
use tracing::debug;

use flux::SourceKind;

/// Immutable result of one resolution pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub artifact: crate::crd::Artifact,
    /// Digest over the discriminating fields of the source, used for
    /// dependency synchronization and change detection.
    pub digest: String,
}

impl From<ResolvedSource> for SourceReferenceStatus {
    fn from(resolved: ResolvedSource) -> Self {
        SourceReferenceStatus {
            artifact: resolved.artifact,
            digest: resolved.digest,
        }
    }
}

/// Resolve the component's source reference. In sticky mode the artifact
/// resolved earlier in the same attempt is reused for as long as the attempt
/// is in flight, so one attempt never observes two source snapshots.
pub async fn resolve(
    store: &dyn ObjectStore,
    head_client: &reqwest::Client,
    component: &Component,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<ResolvedSource, ReconcileError> {
    if component.spec.sticky && component.is_processing(now) {
        if let Some(previous) = component
            .status
            .as_ref()
            .and_then(|status| status.source_ref.as_ref())
        {
            debug!("reusing previously resolved artifact for in-flight attempt");
            return Ok(ResolvedSource {
                artifact: previous.artifact.clone(),
                digest: previous.digest.clone(),
            });
        }
    }

    let namespace = component.metadata.namespace.as_deref().unwrap_or_default();
    match &component.spec.source_ref {
        SourceReference::HttpRepository(repository) => http::resolve(head_client, repository).await,
        SourceReference::FluxGitRepository(name) => {
            flux::resolve(store, SourceKind::GitRepository, &name.with_default_namespace(namespace))
                .await
        }
        SourceReference::FluxOciRepository(name) => {
            flux::resolve(store, SourceKind::OciRepository, &name.with_default_namespace(namespace))
                .await
        }
        SourceReference::FluxBucket(name) => {
            flux::resolve(store, SourceKind::Bucket, &name.with_default_namespace(namespace)).await
        }
        SourceReference::FluxHelmChart(name) => {
            flux::resolve(store, SourceKind::HelmChart, &name.with_default_namespace(namespace))
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        Artifact, ComponentSpec, ComponentStatus, HttpRepository, NamespacedName,
        SourceReferenceStatus,
    };
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    /// Store that fails every lookup; used where resolution must not reach
    /// the cluster at all.
    struct UnreachableStore;

    #[async_trait]
    impl ObjectStore for UnreachableStore {
        async fn get_source(
            &self,
            _kind: SourceKind,
            _name: &NamespacedName,
        ) -> Result<Option<kube::core::DynamicObject>, ReconcileError> {
            panic!("unexpected source lookup");
        }

        async fn get_component(
            &self,
            _name: &NamespacedName,
        ) -> Result<Option<Component>, ReconcileError> {
            panic!("unexpected component lookup");
        }

        async fn list_dependents(&self, _key: &str) -> Result<Vec<Component>, ReconcileError> {
            panic!("unexpected dependent listing");
        }

        async fn get_secret(
            &self,
            _name: &NamespacedName,
        ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ReconcileError> {
            panic!("unexpected secret lookup");
        }
    }

    fn sticky_component() -> Component {
        let mut component = Component::new(
            "main",
            ComponentSpec {
                source_ref: SourceReference::HttpRepository(HttpRepository {
                    // Unroutable; sticky reuse must return before any request.
                    url: "http://unreachable.invalid/chart.tgz".to_string(),
                    digest_header: None,
                    revision_header: None,
                }),
                revision: None,
                sticky: true,
                path: None,
                values: None,
                values_from: vec![],
                decryption: None,
                post_build: None,
                dependencies: vec![],
                requeue_interval_seconds: None,
                timeout_seconds: None,
            },
        );
        component.metadata.namespace = Some("default".to_string());
        component
    }

    #[tokio::test]
    async fn test_sticky_reuse_skips_resolution() {
        let now = chrono::Utc::now();
        let mut component = sticky_component();
        component.status = Some(ComponentStatus {
            processing_since: Some((now - chrono::Duration::seconds(5)).to_rfc3339()),
            source_ref: Some(SourceReferenceStatus {
                artifact: Artifact {
                    url: "http://cached/chart.tgz".to_string(),
                    digest: "abc".to_string(),
                    revision: "v1".to_string(),
                },
                digest: "d".repeat(64),
            }),
            ..Default::default()
        });

        let client = http::new_head_client().unwrap();
        let resolved = resolve(&UnreachableStore, &client, &component, now)
            .await
            .unwrap();
        assert_eq!(resolved.artifact.digest, "abc");
        assert_eq!(resolved.digest, "d".repeat(64));
    }

    #[tokio::test]
    async fn test_sticky_reuse_expires_with_the_attempt() {
        let now = chrono::Utc::now();
        let mut component = sticky_component();
        // Attempt started well past the default ten minute timeout.
        component.status = Some(ComponentStatus {
            processing_since: Some((now - chrono::Duration::seconds(6000)).to_rfc3339()),
            source_ref: Some(SourceReferenceStatus::default()),
            ..Default::default()
        });

        let client = http::new_head_client().unwrap();
        let err = resolve(&UnreachableStore, &client, &component, now)
            .await
            .unwrap_err();
        // Falls through to the real resolver, which cannot reach the host.
        assert!(!err.is_retriable());
    }
}
