//! # Reconciliation
//!
//! The reconcile entry point wired into the watch loop: resolve the source,
//! gate on dependencies, build (or reuse) the generator, assemble the object
//! list and apply it, maintaining the component's status along the way.

use crate::controller::apply::Applier;
use crate::controller::backoff::BackoffState;
use crate::controller::decrypt::{new_decryptor, KeyBundle};
use crate::controller::error::ReconcileError;
use crate::controller::generator::cache::{Fingerprint, GeneratorCache};
use crate::controller::generator::{assemble, build_generator};
use crate::controller::index::DependencyIndex;
use crate::controller::source::http;
use crate::controller::store::ObjectStore;
use crate::controller::hooks;
use crate::crd::{
    Component, ComponentState, ComponentStatus, Condition, NamespacedName, SecretKeyReference,
    FINALIZER,
};
use anyhow::Context as _;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::Action;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};

/// Value document keys tried when a values secret reference names no key.
const DEFAULT_VALUES_KEYS: [&str; 3] = ["values", "values.yaml", "values.yml"];

/// Shared state handed to every reconciliation.
pub struct Context {
    pub client: Client,
    pub store: Arc<dyn ObjectStore>,
    pub applier: Arc<dyn Applier>,
    pub cache: GeneratorCache,
    /// Client for artifact downloads; follows redirects.
    pub download_client: reqwest::Client,
    /// Client for HEAD resolution; redirects handled manually.
    pub head_client: reqwest::Client,
    /// Backoff state per resource, keyed by `namespace/name`.
    pub backoff_states: Mutex<HashMap<String, BackoffState>>,
    /// Reverse dependency index feeding the dependent-requeue watch mapper.
    pub index: Arc<DependencyIndex>,
}

impl Context {
    pub fn new(
        client: Client,
        store: Arc<dyn ObjectStore>,
        applier: Arc<dyn Applier>,
        cache: GeneratorCache,
    ) -> anyhow::Result<Self> {
        Ok(Context {
            client,
            store,
            applier,
            cache,
            download_client: reqwest::Client::builder()
                .build()
                .context("failed to build http client")?,
            head_client: http::new_head_client()?,
            backoff_states: Mutex::new(HashMap::new()),
            index: Arc::new(DependencyIndex::default()),
        })
    }
}

pub async fn reconcile(
    component: Arc<Component>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = component
        .metadata
        .name
        .clone()
        .ok_or_else(|| ReconcileError::Precondition("component has no name".to_string()))?;
    let namespace = component
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| ReconcileError::Precondition("component has no namespace".to_string()))?;

    let span = info_span!("reconcile", component = %format!("{namespace}/{name}"));
    async {
        if component.metadata.deletion_timestamp.is_some() {
            return finalize_deletion(&component, &ctx, &namespace, &name).await;
        }
        ctx.index.update(&component);
        ensure_finalizer(&ctx.client, &component, &namespace, &name).await?;

        let now = chrono::Utc::now();
        let mut status = component.status.clone().unwrap_or_default();
        status.observed_generation = component.metadata.generation;
        status.last_observed_at = Some(now.to_rfc3339());
        status.state = Some(ComponentState::Processing);
        if !component.is_processing(now) {
            status.processing_since = Some(now.to_rfc3339());
        }

        match reconcile_inner(&component, &ctx, &mut status, now, &namespace, &name).await {
            Ok(action) => Ok(action),
            Err(err) => {
                status.state = Some(ComponentState::Error);
                set_condition(&mut status, "Ready", "False", "ReconciliationFailed", &err.to_string());
                // Best effort; the error itself drives the retry.
                if let Err(status_err) = push_status(&ctx.client, &namespace, &name, &status).await {
                    warn!("failed to record error status: {status_err}");
                }
                Err(err)
            }
        }
    }
    .instrument(span)
    .await
}

async fn reconcile_inner(
    component: &Component,
    ctx: &Arc<Context>,
    status: &mut ComponentStatus,
    now: chrono::DateTime<chrono::Utc>,
    namespace: &str,
    name: &str,
) -> Result<Action, ReconcileError> {
    let resolved = hooks::post_read(ctx.store.as_ref(), &ctx.head_client, component, now).await?;
    info!(
        revision = %resolved.artifact.revision,
        digest = %resolved.artifact.digest,
        "resolved source"
    );

    // The attempt must be visible on the cluster before the dependency gate
    // runs, so siblings sharing this source can compare against it.
    hooks::stamp_attempt(status, &resolved);
    set_condition(status, "Ready", "False", "Processing", "reconciliation in progress");
    push_status(&ctx.client, namespace, name, status).await?;

    hooks::pre_reconcile(ctx.store.as_ref(), component, &resolved).await?;

    let (provider, key_bundle) = load_key_bundle(ctx.store.as_ref(), component).await?;
    let fingerprint = Fingerprint::new(
        &resolved.artifact.digest,
        component.spec.path.as_deref(),
        provider.as_deref(),
        &key_bundle.digest(),
    );
    let generator = ctx
        .cache
        .get_or_build(&fingerprint, || {
            let client = ctx.download_client.clone();
            let url = resolved.artifact.url.clone();
            let path = component.spec.path.clone();
            let provider = provider.clone();
            async move {
                let decryptor = new_decryptor(provider.as_deref(), key_bundle)?;
                build_generator(&client, &url, path.as_deref(), decryptor).await
            }
        })
        .await?;

    let value_docs = gather_values(ctx.store.as_ref(), component).await?;
    let substitution_sources = gather_substitutions(ctx.store.as_ref(), component).await?;
    let post_build = component.spec.post_build.clone().unwrap_or_default();
    let objects = assemble::assemble(
        generator.as_ref(),
        &value_docs,
        component.spec.values.as_ref(),
        substitution_sources,
        post_build.substitute.as_ref(),
        namespace,
        name,
    )
    .await?;

    ctx.applier.apply(namespace, &objects).await?;

    hooks::stamp_applied(status);
    status.state = Some(ComponentState::Ready);
    status.processing_since = None;
    set_condition(status, "Ready", "True", "ReconciliationSucceeded", "applied successfully");
    push_status(&ctx.client, namespace, name, status).await?;

    reset_backoff(ctx, namespace, name);
    info!(
        "✅ Reconciliation complete for {name} (applied {} objects, revision {})",
        objects.len(),
        resolved.artifact.revision
    );
    Ok(success_action(component))
}

/// Requeue at the configured interval, otherwise wait for the next watch
/// event (the http checker nudges http sources via an annotation).
fn success_action(component: &Component) -> Action {
    match component.spec.requeue_interval_seconds {
        Some(seconds) => Action::requeue(Duration::from_secs(seconds)),
        None => Action::await_change(),
    }
}

async fn finalize_deletion(
    component: &Component,
    ctx: &Arc<Context>,
    namespace: &str,
    name: &str,
) -> Result<Action, ReconcileError> {
    if !component.finalizers().iter().any(|f| f == FINALIZER) {
        forget_resource(ctx, namespace, name);
        return Ok(Action::await_change());
    }
    if let Err(err) = hooks::pre_delete(ctx.store.as_ref(), component).await {
        let mut status = component.status.clone().unwrap_or_default();
        status.state = Some(ComponentState::DeletionBlocked);
        set_condition(&mut status, "Ready", "False", "DeletionBlocked", &err.to_string());
        if let Err(status_err) = push_status(&ctx.client, namespace, name, &status).await {
            warn!("failed to record deletion-blocked status: {status_err}");
        }
        return Err(err);
    }

    let finalizers: Vec<String> = component
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    let api: Api<Component> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|err| ReconcileError::retriable(format!("failed to remove finalizer: {err}")))?;
    forget_resource(ctx, namespace, name);
    info!("removed finalizer, deletion proceeds");
    Ok(Action::await_change())
}

/// Clear per-resource state once the component leaves the cluster.
fn forget_resource(ctx: &Context, namespace: &str, name: &str) {
    ctx.index.forget(namespace, name);
    forget_backoff(&ctx.backoff_states, namespace, name);
}

fn forget_backoff(states: &Mutex<HashMap<String, BackoffState>>, namespace: &str, name: &str) {
    if let Ok(mut states) = states.lock() {
        states.remove(&format!("{namespace}/{name}"));
    }
}

async fn ensure_finalizer(
    client: &Client,
    component: &Component,
    namespace: &str,
    name: &str,
) -> Result<(), ReconcileError> {
    if component.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let mut finalizers = component.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let api: Api<Component> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|err| ReconcileError::retriable(format!("failed to add finalizer: {err}")))?;
    Ok(())
}

async fn push_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &ComponentStatus,
) -> Result<(), ReconcileError> {
    let api: Api<Component> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({"status": status});
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|err| ReconcileError::retriable(format!("failed to update status: {err}")))?;
    Ok(())
}

/// Set a condition, preserving the transition time when the condition status
/// is unchanged.
fn set_condition(
    status: &mut ComponentStatus,
    r#type: &str,
    condition_status: &str,
    reason: &str,
    message: &str,
) {
    let now = chrono::Utc::now().to_rfc3339();
    if let Some(existing) = status.conditions.iter_mut().find(|c| c.r#type == r#type) {
        if existing.status != condition_status {
            existing.last_transition_time = Some(now);
        }
        existing.status = condition_status.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
        return;
    }
    status.conditions.push(Condition {
        r#type: r#type.to_string(),
        status: condition_status.to_string(),
        last_transition_time: Some(now),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    });
}

async fn load_key_bundle(
    store: &dyn ObjectStore,
    component: &Component,
) -> Result<(Option<String>, KeyBundle), ReconcileError> {
    let Some(decryption) = &component.spec.decryption else {
        return Ok((None, KeyBundle::new(BTreeMap::new())));
    };
    let namespace = component.metadata.namespace.as_deref().unwrap_or_default();
    let name = NamespacedName {
        namespace: decryption.secret_ref.namespace.clone(),
        name: decryption.secret_ref.name.clone(),
    }
    .with_default_namespace(namespace);
    let Some(data) = store.get_secret(&name).await? else {
        return Err(ReconcileError::retriable(format!(
            "decryption secret {name} not found"
        )));
    };
    Ok((decryption.provider.clone(), KeyBundle::new(data)))
}

async fn gather_values(
    store: &dyn ObjectStore,
    component: &Component,
) -> Result<Vec<Vec<u8>>, ReconcileError> {
    let namespace = component.metadata.namespace.as_deref().unwrap_or_default();
    let mut docs = Vec::with_capacity(component.spec.values_from.len());
    for reference in &component.spec.values_from {
        docs.push(values_document(store, namespace, reference).await?);
    }
    Ok(docs)
}

async fn values_document(
    store: &dyn ObjectStore,
    namespace: &str,
    reference: &SecretKeyReference,
) -> Result<Vec<u8>, ReconcileError> {
    let name = NamespacedName {
        namespace: reference.namespace.clone(),
        name: reference.name.clone(),
    }
    .with_default_namespace(namespace);
    let Some(data) = store.get_secret(&name).await? else {
        return Err(ReconcileError::retriable(format!(
            "values secret {name} not found"
        )));
    };
    if let Some(key) = &reference.key {
        return data.get(key).cloned().ok_or_else(|| {
            ReconcileError::fatal(format!("secret {name} has no key {key:?}"))
        });
    }
    for key in DEFAULT_VALUES_KEYS {
        if let Some(doc) = data.get(key) {
            return Ok(doc.clone());
        }
    }
    Err(ReconcileError::fatal(format!(
        "secret {name} has none of the default values keys {DEFAULT_VALUES_KEYS:?}"
    )))
}

async fn gather_substitutions(
    store: &dyn ObjectStore,
    component: &Component,
) -> Result<Vec<BTreeMap<String, String>>, ReconcileError> {
    let Some(post_build) = &component.spec.post_build else {
        return Ok(vec![]);
    };
    let namespace = component.metadata.namespace.as_deref().unwrap_or_default();
    let mut sources = Vec::with_capacity(post_build.substitute_from.len());
    for reference in &post_build.substitute_from {
        let name = NamespacedName {
            namespace: reference.namespace.clone(),
            name: reference.name.clone(),
        }
        .with_default_namespace(namespace);
        let Some(data) = store.get_secret(&name).await? else {
            return Err(ReconcileError::retriable(format!(
                "substitution secret {name} not found"
            )));
        };
        let mut variables = BTreeMap::new();
        for (key, value) in data {
            let value = String::from_utf8(value).map_err(|_| {
                ReconcileError::fatal(format!(
                    "substitution secret {name} key {key:?} is not valid utf-8"
                ))
            })?;
            variables.insert(key, value);
        }
        sources.push(variables);
    }
    Ok(sources)
}

fn reset_backoff(ctx: &Context, namespace: &str, name: &str) {
    if let Ok(mut states) = ctx.backoff_states.lock() {
        if let Some(state) = states.get_mut(&format!("{namespace}/{name}")) {
            state.reset();
        }
    }
}

/// Retriable errors with a suggested delay requeue at exactly that delay;
/// everything else backs off per resource along the Fibonacci sequence.
pub fn error_policy(
    component: Arc<Component>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    let key = component.namespaced_name().to_string();
    tracing::error!(component = %key, "reconciliation failed: {error}");

    if let Some(delay) = error.retry_after() {
        return Action::requeue(delay);
    }
    let backoff_seconds = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states.entry(key).or_default();
            state.increment_error();
            state.backoff.next_backoff_seconds()
        }
        Err(_) => 60,
    };
    Action::requeue(Duration::from_secs(backoff_seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::source::flux::SourceKind;
    use crate::crd::{ComponentSpec, HttpRepository, PostBuild, SecretReference, SourceReference};
    use async_trait::async_trait;
    use kube::core::DynamicObject;

    struct SecretStore {
        secrets: HashMap<String, BTreeMap<String, Vec<u8>>>,
    }

    impl SecretStore {
        fn new(entries: Vec<(&str, Vec<(&str, &[u8])>)>) -> Self {
            let secrets = entries
                .into_iter()
                .map(|(name, data)| {
                    (
                        name.to_string(),
                        data.into_iter()
                            .map(|(k, v)| (k.to_string(), v.to_vec()))
                            .collect(),
                    )
                })
                .collect();
            SecretStore { secrets }
        }
    }

    #[async_trait]
    impl ObjectStore for SecretStore {
        async fn get_source(
            &self,
            _kind: SourceKind,
            _name: &NamespacedName,
        ) -> Result<Option<DynamicObject>, ReconcileError> {
            Ok(None)
        }

        async fn get_component(
            &self,
            _name: &NamespacedName,
        ) -> Result<Option<Component>, ReconcileError> {
            Ok(None)
        }

        async fn list_dependents(&self, _key: &str) -> Result<Vec<Component>, ReconcileError> {
            Ok(vec![])
        }

        async fn get_secret(
            &self,
            name: &NamespacedName,
        ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ReconcileError> {
            Ok(self.secrets.get(&name.to_string()).cloned())
        }
    }

    fn component(values_from: Vec<SecretKeyReference>, post_build: Option<PostBuild>) -> Component {
        let mut component = Component::new(
            "main",
            ComponentSpec {
                source_ref: SourceReference::HttpRepository(HttpRepository {
                    url: "http://example.com/chart.tgz".to_string(),
                    digest_header: None,
                    revision_header: None,
                }),
                revision: None,
                sticky: false,
                path: None,
                values: None,
                values_from,
                decryption: None,
                post_build,
                dependencies: vec![],
                requeue_interval_seconds: None,
                timeout_seconds: None,
            },
        );
        component.metadata.namespace = Some("default".to_string());
        component
    }

    #[tokio::test]
    async fn test_gather_values_tries_default_keys() {
        let store = SecretStore::new(vec![(
            "default/app-values",
            vec![("values.yaml", b"replicas: 2\n".as_slice())],
        )]);
        let component = component(
            vec![SecretKeyReference {
                name: "app-values".to_string(),
                namespace: None,
                key: None,
            }],
            None,
        );
        let docs = gather_values(&store, &component).await.unwrap();
        assert_eq!(docs, vec![b"replicas: 2\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_gather_values_missing_secret_is_retriable() {
        let store = SecretStore::new(vec![]);
        let component = component(
            vec![SecretKeyReference {
                name: "app-values".to_string(),
                namespace: None,
                key: None,
            }],
            None,
        );
        let err = gather_values(&store, &component).await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_gather_values_missing_key_is_fatal() {
        let store = SecretStore::new(vec![("default/app-values", vec![("other", b"".as_slice())])]);
        let component = component(
            vec![SecretKeyReference {
                name: "app-values".to_string(),
                namespace: None,
                key: Some("missing".to_string()),
            }],
            None,
        );
        let err = gather_values(&store, &component).await.unwrap_err();
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_gather_substitutions_decodes_utf8() {
        let store = SecretStore::new(vec![(
            "default/vars",
            vec![("REGION", b"eu-west-1".as_slice())],
        )]);
        let component = component(
            vec![],
            Some(PostBuild {
                substitute: None,
                substitute_from: vec![SecretReference {
                    name: "vars".to_string(),
                    namespace: None,
                }],
            }),
        );
        let sources = gather_substitutions(&store, &component).await.unwrap();
        assert_eq!(sources[0]["REGION"], "eu-west-1");
    }

    #[test]
    fn test_set_condition_preserves_transition_time() {
        let mut status = ComponentStatus::default();
        set_condition(&mut status, "Ready", "False", "Processing", "working");
        let first_transition = status.conditions[0].last_transition_time.clone();
        set_condition(&mut status, "Ready", "False", "Processing", "still working");
        assert_eq!(status.conditions[0].last_transition_time, first_transition);
        assert_eq!(status.conditions[0].message.as_deref(), Some("still working"));
        set_condition(&mut status, "Ready", "True", "ReconciliationSucceeded", "done");
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, "True");
    }

    #[test]
    fn test_forget_backoff_drops_only_the_deleted_resource() {
        let states = Mutex::new(HashMap::from([
            ("default/app".to_string(), BackoffState::default()),
            ("default/other".to_string(), BackoffState::default()),
        ]));
        forget_backoff(&states, "default", "app");
        let states = states.lock().unwrap();
        assert!(!states.contains_key("default/app"));
        assert!(states.contains_key("default/other"));
    }

    #[test]
    fn test_success_action_honors_requeue_interval() {
        let mut c = component(vec![], None);
        assert_eq!(success_action(&c), Action::await_change());
        c.spec.requeue_interval_seconds = Some(300);
        assert_eq!(success_action(&c), Action::requeue(Duration::from_secs(300)));
    }
}
