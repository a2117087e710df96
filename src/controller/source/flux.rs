//! Resolution of flux source objects (GitRepository, OCIRepository, Bucket,
//! HelmChart) into artifacts. The objects are fetched as [`DynamicObject`]s
//! so the flux CRD types do not need to be vendored.

use crate::controller::digest::calculate_digest;
use crate::controller::error::ReconcileError;
use crate::controller::source::ResolvedSource;
use crate::controller::store::ObjectStore;
use crate::crd::{Artifact, NamespacedName};
use kube::api::{ApiResource, GroupVersionKind};
use kube::core::DynamicObject;
use std::collections::BTreeMap;
use std::time::Duration;

const FLUX_SOURCE_GROUP: &str = "source.toolkit.fluxcd.io";

/// Delay suggested while waiting for a flux source to appear or become ready.
const NOT_READY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    GitRepository,
    OciRepository,
    Bucket,
    HelmChart,
}

impl SourceKind {
    pub fn api_resource(self) -> ApiResource {
        let (version, kind) = match self {
            SourceKind::GitRepository => ("v1", "GitRepository"),
            SourceKind::HelmChart => ("v1", "HelmChart"),
            SourceKind::OciRepository => ("v1beta2", "OCIRepository"),
            SourceKind::Bucket => ("v1beta2", "Bucket"),
        };
        ApiResource::from_gvk(&GroupVersionKind::gvk(FLUX_SOURCE_GROUP, version, kind))
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            SourceKind::GitRepository => "GitRepository",
            SourceKind::OciRepository => "OCIRepository",
            SourceKind::Bucket => "Bucket",
            SourceKind::HelmChart => "HelmChart",
        };
        f.write_str(kind)
    }
}

/// Projection of a flux source object: the fields that identify its current
/// artifact and decide readiness.
#[derive(Debug, Clone)]
pub struct ExternalSource {
    pub uid: String,
    pub generation: i64,
    pub annotations: BTreeMap<String, String>,
    pub artifact: Option<Artifact>,
    pub ready: bool,
}

impl ExternalSource {
    pub fn from_object(object: &DynamicObject) -> Self {
        let metadata = &object.metadata;
        let generation = metadata.generation.unwrap_or_default();
        let status = &object.data["status"];

        let artifact = status.get("artifact").and_then(|artifact| {
            let url = artifact.get("url")?.as_str()?;
            let digest = artifact.get("digest")?.as_str()?;
            let revision = artifact.get("revision")?.as_str()?;
            Some(Artifact {
                url: url.to_string(),
                digest: digest.to_string(),
                revision: revision.to_string(),
            })
        });

        // Ready means the Ready condition is true for the current generation.
        let ready = status
            .get("conditions")
            .and_then(|conditions| conditions.as_array())
            .is_some_and(|conditions| {
                conditions.iter().any(|condition| {
                    condition.get("type").and_then(|t| t.as_str()) == Some("Ready")
                        && condition.get("status").and_then(|s| s.as_str()) == Some("True")
                        && condition
                            .get("observedGeneration")
                            .and_then(|g| g.as_i64())
                            .unwrap_or(generation)
                            == generation
                })
            });

        ExternalSource {
            uid: metadata.uid.clone().unwrap_or_default(),
            generation,
            annotations: metadata
                .annotations
                .clone()
                .map(|annotations| annotations.into_iter().collect())
                .unwrap_or_default(),
            artifact,
            ready,
        }
    }
}

/// Resolve a flux source reference, waiting (retriably) for the object to
/// exist, become ready and expose a complete artifact.
pub async fn resolve(
    store: &dyn ObjectStore,
    kind: SourceKind,
    name: &NamespacedName,
) -> Result<ResolvedSource, ReconcileError> {
    let object = store
        .get_source(kind, name)
        .await?
        .ok_or_else(|| {
            ReconcileError::retriable_after(
                format!("{kind} {name} not found"),
                NOT_READY_DELAY,
            )
        })?;
    let source = ExternalSource::from_object(&object);

    if !source.ready {
        return Err(ReconcileError::retriable_after(
            format!("{kind} {name} is not ready"),
            NOT_READY_DELAY,
        ));
    }
    let artifact = source.artifact.ok_or_else(|| {
        ReconcileError::retriable_after(
            format!("{kind} {name} has no complete artifact yet"),
            NOT_READY_DELAY,
        )
    })?;

    let digest = calculate_digest(&(
        &source.uid,
        source.generation,
        &source.annotations,
        &artifact.url,
        &artifact.digest,
        &artifact.revision,
    ));
    Ok(ResolvedSource { artifact, digest })
}
