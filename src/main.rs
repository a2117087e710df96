use anyhow::{Context as _, Result};
use clap::Parser;
use component_controller::controller::apply::ServerSideApplier;
use component_controller::controller::generator::cache::GeneratorCache;
use component_controller::controller::reconcile::{error_policy, reconcile, Context};
use component_controller::controller::store::KubeObjectStore;
use component_controller::controller::checker;
use component_controller::controller::index::dependents_to_requeue;
use component_controller::crd::Component;
use futures::StreamExt;
use kube::api::Api;
use kube::Client;
use kube_runtime::{watcher, Controller};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "component-controller", about = "Reconciles Component resources from versioned template archives")]
struct Args {
    /// Validity window for cached generators, in seconds.
    #[arg(long, env = "CACHE_VALIDITY_SECONDS", default_value_t = 3600)]
    cache_validity_seconds: u64,

    /// Interval of the cache eviction sweep, in seconds.
    #[arg(long, env = "CACHE_SWEEP_INTERVAL_SECONDS", default_value_t = 10)]
    cache_sweep_interval_seconds: u64,

    /// Interval between HEAD probes of HTTP repository sources, in seconds.
    #[arg(long, env = "HTTP_CHECK_INTERVAL_SECONDS", default_value_t = 30)]
    http_check_interval_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "component_controller=info".into()),
        )
        .init();

    info!("Starting Component Controller");

    // Pin the rustls crypto provider before any TLS use; feature unification
    // can otherwise leave two providers in the dependency graph.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;

    let cache = GeneratorCache::new(
        Duration::from_secs(args.cache_validity_seconds),
        Duration::from_secs(args.cache_sweep_interval_seconds),
    );
    let context = Arc::new(Context::new(
        client.clone(),
        Arc::new(KubeObjectStore::new(client.clone())),
        Arc::new(ServerSideApplier::new(client.clone())),
        cache,
    )?);

    let checker_handle = checker::spawn(
        client.clone(),
        Duration::from_secs(args.http_check_interval_seconds),
    );

    // Watch all namespaces with semantic change detection so newly created
    // components are picked up immediately. The secondary watch requeues
    // dependents as soon as the component they wait on turns ready, instead
    // of leaving them to their error backoff.
    let components: Api<Component> = Api::all(client.clone());
    let index = Arc::clone(&context.index);
    Controller::new(components, watcher::Config::default().any_semantic())
        .watches(
            Api::<Component>::all(client),
            watcher::Config::default().any_semantic(),
            move |component| dependents_to_requeue(&index, &component),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, context.clone())
        .for_each(|result| {
            if let Err(err) = result {
                warn!("watch stream error: {err:?}");
            }
            std::future::ready(())
        })
        .await;

    checker_handle.abort();
    context.cache.shutdown();
    info!("Controller stopped");
    Ok(())
}
