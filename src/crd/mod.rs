//! # Component Custom Resource Definition
//!
//! A `Component` declares a versioned template source (an HTTP-hosted archive
//! or a flux source object), optional decryption settings, values for the
//! templating engine, post-build variable substitution and dependencies on
//! other Components. The controller continuously reconciles the generated
//! objects into the cluster.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group of the Component CRD; also used as the prefix for controller
/// owned annotations.
pub const GROUP: &str = "component-management.microscaler.io";

/// Objects carrying this annotation with value `"true"` are excluded from
/// post-build variable substitution.
pub const DISABLE_SUBSTITUTION_ANNOTATION: &str =
    "component-management.microscaler.io/disable-substitution";

/// Annotation bumped by the HTTP repository checker to trigger a requeue via
/// the watch stream when an HTTP source moved to a new digest/revision.
pub const REQUEUE_ANNOTATION: &str = "component-management.microscaler.io/requeue";

/// Finalizer guarding deletion until the dependency gate passes.
pub const FINALIZER: &str = "component-management.microscaler.io/finalizer";

/// Default timeout after which a reconciliation attempt is considered no
/// longer in flight (sticky artifact reuse stops applying).
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Component",
    group = "component-management.microscaler.io",
    version = "v1",
    namespaced,
    status = "ComponentStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Revision", "type":"string", "jsonPath":".status.lastAppliedRevision"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Source of the templates used to render the dependent objects.
    ///
    /// The singleton-map representation keeps the `variant: { ... }` form
    /// working from YAML manifests as well as from the JSON wire format;
    /// serde_yaml would otherwise insist on `!Tag` syntax for the enum.
    #[serde(with = "serde_yaml::with::singleton_map")]
    #[schemars(with = "SourceReference")]
    pub source_ref: SourceReference,
    /// Optional revision pin. When set, reconciliation waits until the
    /// source reports exactly this revision.
    #[serde(default)]
    pub revision: Option<String>,
    /// Reuse the previously resolved artifact for the remainder of an
    /// in-flight reconciliation attempt instead of re-resolving.
    #[serde(default)]
    pub sticky: bool,
    /// Path within the extracted archive that contains the chart or overlay.
    #[serde(default)]
    pub path: Option<String>,
    /// Inline values passed to the templating engine; merged last, so inline
    /// values win over values from secrets.
    #[serde(default)]
    pub values: Option<serde_json::Map<String, serde_json::Value>>,
    /// Secrets containing value documents, merged in declared order.
    #[serde(default)]
    pub values_from: Vec<SecretKeyReference>,
    /// Decryption settings for encrypted files within the source archive.
    #[serde(default)]
    pub decryption: Option<Decryption>,
    /// Post-build variable substitution settings.
    #[serde(default)]
    pub post_build: Option<PostBuild>,
    /// Components that must be reconciled and ready before this one.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Interval between periodic reconciliations, in seconds.
    #[serde(default)]
    pub requeue_interval_seconds: Option<u64>,
    /// Timeout for one reconciliation attempt, in seconds. Defaults to the
    /// requeue interval, or ten minutes if neither is set.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Source of the templates. Exactly one variant is set; the enum makes the
/// choice exhaustive at the type level.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum SourceReference {
    /// Generic HTTP repository; the controller issues HEAD requests to
    /// retrieve digest/revision headers and a potentially redirected
    /// location of the source artifact.
    HttpRepository(HttpRepository),
    /// Reference to a flux GitRepository.
    FluxGitRepository(NamespacedName),
    /// Reference to a flux OCIRepository.
    FluxOciRepository(NamespacedName),
    /// Reference to a flux Bucket.
    FluxBucket(NamespacedName),
    /// Reference to a flux HelmChart.
    FluxHelmChart(NamespacedName),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpRepository {
    /// URL of the source. Redirects are followed as long as the response
    /// does not carry the digest header.
    pub url: String,
    /// Name of the header containing the digest of the source artifact.
    /// Defaults to `etag`.
    #[serde(default)]
    pub digest_header: Option<String>,
    /// Name of the header containing the revision of the source artifact.
    /// Defaults to the digest header.
    #[serde(default)]
    pub revision_header: Option<String>,
}

/// Decryption settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Decryption {
    /// Decryption provider. The only supported value is `sops`, which is
    /// the default if omitted.
    #[serde(default)]
    pub provider: Option<String>,
    /// Secret containing the decryption keys; entries ending in `.asc` are
    /// imported as PGP keys, entries ending in `.agekey` as age identities.
    pub secret_ref: SecretReference,
}

/// Post-build settings. Rendered manifests may contain `${VAR}` / `$VAR`
/// placeholders. If a variable appears in more than one secret, later values
/// win, and inline values win over secret values.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostBuild {
    /// Inline variables to substitute into the rendered manifests.
    #[serde(default)]
    pub substitute: Option<BTreeMap<String, String>>,
    /// Secrets containing substitution variables.
    #[serde(default)]
    pub substitute_from: Vec<SecretReference>,
}

/// Dependency on another Component, referenced by namespace and name.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    #[serde(flatten)]
    pub name: NamespacedName,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Key within the secret holding the value document. When omitted, the
    /// keys `values`, `values.yaml` and `values.yml` are tried in order.
    #[serde(default)]
    pub key: Option<String>,
}

/// A tuple of namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedName {
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        NamespacedName {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Copy of this NamespacedName with the given namespace filled in if
    /// none is set.
    pub fn with_default_namespace(&self, namespace: &str) -> NamespacedName {
        NamespacedName {
            namespace: Some(
                self.namespace
                    .clone()
                    .unwrap_or_else(|| namespace.to_string()),
            ),
            name: self.name.clone(),
        }
    }
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) if !namespace.is_empty() => write!(f, "{}/{}", namespace, self.name),
            _ => write!(f, "{}", self.name),
        }
    }
}

/// Identity triple of one snapshot of the template source. Two artifacts are
/// content-equal iff digest and revision match; the URL is transport detail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub url: String,
    pub digest: String,
    pub revision: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Conditions represent the latest available observations.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub state: Option<ComponentState>,
    /// Artifact and digest of the most recently resolved source reference.
    #[serde(default)]
    pub source_ref: Option<SourceReferenceStatus>,
    #[serde(default)]
    pub last_attempted_digest: Option<String>,
    #[serde(default)]
    pub last_attempted_revision: Option<String>,
    #[serde(default)]
    pub last_applied_digest: Option<String>,
    #[serde(default)]
    pub last_applied_revision: Option<String>,
    /// RFC 3339 timestamp set when a reconciliation attempt starts and
    /// cleared once it succeeds.
    #[serde(default)]
    pub processing_since: Option<String>,
    /// RFC 3339 timestamp of the last reconciliation pass over this object.
    #[serde(default)]
    pub last_observed_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceReferenceStatus {
    pub artifact: Artifact,
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ComponentState {
    Processing,
    Ready,
    Error,
    DeletionBlocked,
}

/// Condition represents a status condition for the resource.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of condition (True, False, Unknown)
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Component {
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName {
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone().unwrap_or_default(),
        }
    }

    /// A component is ready once its current generation has been observed
    /// and the Ready condition is true.
    pub fn is_ready(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        if status.observed_generation != self.metadata.generation {
            return false;
        }
        status
            .conditions
            .iter()
            .any(|c| c.r#type == "Ready" && c.status == "True")
    }

    /// Timeout for one reconciliation attempt: the configured timeout, else
    /// the requeue interval, else ten minutes.
    pub fn timeout(&self) -> std::time::Duration {
        let seconds = self
            .spec
            .timeout_seconds
            .or(self.spec.requeue_interval_seconds)
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        std::time::Duration::from_secs(seconds)
    }

    /// Whether a reconciliation attempt is currently in flight, i.e. it
    /// started less than the attempt timeout ago. Sticky artifact reuse only
    /// applies while this holds.
    pub fn is_processing(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        let Some(since) = &status.processing_since else {
            return false;
        };
        let Ok(since) = chrono::DateTime::parse_from_rfc3339(since) else {
            return false;
        };
        let timeout = chrono::Duration::from_std(self.timeout()).unwrap_or(chrono::Duration::zero());
        now.signed_duration_since(since.with_timezone(&chrono::Utc)) < timeout
    }

    /// Keys under which this component is indexed by its dependencies,
    /// `namespace/name` with the component's own namespace as default.
    pub fn dependency_keys(&self) -> Vec<String> {
        let namespace = self.metadata.namespace.as_deref().unwrap_or_default();
        self.spec
            .dependencies
            .iter()
            .map(|d| d.name.with_default_namespace(namespace).to_string())
            .collect()
    }
}
