//! Background checker for HTTP repository sources. Flux sources push change
//! notifications through the watch stream, HTTP repositories do not, so a
//! periodic HEAD probe detects moved digests and nudges the affected
//! components back through the controller by bumping an annotation.

use crate::controller::source::http;
use crate::crd::{Component, SourceReference, REQUEUE_ANNOTATION};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub fn spawn(client: Client, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(head_client) = http::new_head_client() else {
            warn!("http checker disabled, failed to build http client");
            return;
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = check_all(&client, &head_client).await {
                warn!("http source check failed: {err:#}");
            }
        }
    })
}

async fn check_all(client: &Client, head_client: &reqwest::Client) -> anyhow::Result<()> {
    let api: Api<Component> = Api::all(client.clone());
    let components = api.list(&ListParams::default()).await?;
    for component in components.items {
        let SourceReference::HttpRepository(repository) = &component.spec.source_ref else {
            continue;
        };
        let resolved = match http::resolve(head_client, repository).await {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(
                    component = %component.namespaced_name(),
                    "failed to probe http source: {err}"
                );
                continue;
            }
        };
        if !has_moved(&component, &resolved.artifact.digest, &resolved.artifact.revision) {
            continue;
        }
        debug!(
            component = %component.namespaced_name(),
            revision = %resolved.artifact.revision,
            "http source moved, requeueing"
        );
        requeue(client, &component).await?;
    }
    Ok(())
}

/// Whether the probed digest/revision differs from the component's last
/// attempt.
fn has_moved(component: &Component, digest: &str, revision: &str) -> bool {
    let Some(status) = &component.status else {
        return true;
    };
    status.last_attempted_digest.as_deref() != Some(digest)
        || status.last_attempted_revision.as_deref() != Some(revision)
}

/// Bump the requeue annotation; the resulting watch event re-enqueues the
/// component.
async fn requeue(client: &Client, component: &Component) -> anyhow::Result<()> {
    let namespace = component.metadata.namespace.as_deref().unwrap_or_default();
    let api: Api<Component> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({
        "metadata": {
            "annotations": {
                REQUEUE_ANNOTATION: chrono::Utc::now().to_rfc3339(),
            }
        }
    });
    api.patch(
        &component.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ComponentSpec, ComponentStatus, HttpRepository};

    fn component(status: Option<ComponentStatus>) -> Component {
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
                values_from: vec![],
                decryption: None,
                post_build: None,
                dependencies: vec![],
                requeue_interval_seconds: None,
                timeout_seconds: None,
            },
        );
        component.status = status;
        component
    }

    #[test]
    fn test_component_without_status_has_moved() {
        assert!(has_moved(&component(None), "d1", "r1"));
    }

    #[test]
    fn test_unchanged_source_has_not_moved() {
        let component = component(Some(ComponentStatus {
            last_attempted_digest: Some("d1".to_string()),
            last_attempted_revision: Some("r1".to_string()),
            ..Default::default()
        }));
        assert!(!has_moved(&component, "d1", "r1"));
        assert!(has_moved(&component, "d2", "r1"));
        assert!(has_moved(&component, "d1", "r2"));
    }
}
