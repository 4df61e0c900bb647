// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use axum::{routing::get, Router};
use clap::Parser;
use cmmc::constants::{
    DEFAULT_HEALTH_PROBE_BIND_ADDRESS, DEFAULT_LEASE_DURATION_SECS, DEFAULT_LEASE_GRACE_SECS,
    DEFAULT_LEASE_NAMESPACE, DEFAULT_METRICS_BIND_ADDRESS, ERROR_REQUEUE_DURATION_SECS,
    LEASE_NAME, METRICS_SERVER_PATH, MISCONFIGURED_REQUEUE_DURATION_SECS, TOKIO_WORKER_THREADS,
};
use cmmc::context::{Context, Stores};
use cmmc::crd::{MergeSource, MergeTarget};
use cmmc::metrics;
use cmmc::reconcilers::merge_target::MisconfiguredTargetError;
use cmmc::reconcilers::{merge_source, merge_target};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use kube_lease_manager::LeaseManagerBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct ReconcileError(#[from] anyhow::Error);

/// ConfigMap Merge Controller.
///
/// Aggregates fragments of configuration scattered across many ConfigMaps in
/// many namespaces into a single, validated target ConfigMap.
#[derive(Parser, Debug)]
#[command(name = "cmmc", version)]
struct Args {
    /// The address the metric endpoint binds to.
    #[arg(long, default_value = DEFAULT_METRICS_BIND_ADDRESS)]
    metrics_bind_address: String,

    /// The address the probe endpoint binds to.
    #[arg(long, default_value = DEFAULT_HEALTH_PROBE_BIND_ADDRESS)]
    health_probe_bind_address: String,

    /// Enable leader election for the controller manager. Ensures there is
    /// only one active controller manager.
    #[arg(long)]
    leader_elect: bool,

    /// Maximum concurrent reconciles for the MergeSource controller.
    #[arg(long, default_value_t = 1)]
    merge_source_max_concurrent_reconciles: u16,

    /// Maximum concurrent reconciles for the MergeTarget controller.
    #[arg(long, default_value_t = 1)]
    merge_target_max_concurrent_reconciles: u16,
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("cmmc-controller")
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();
    initialize_logging();
    info!("Starting ConfigMap Merge Controller");

    let client = Client::try_default().await?;

    let _metrics_handle = start_metrics_server(listen_addr(&args.metrics_bind_address));
    let _health_handle = start_health_server(listen_addr(&args.health_probe_bind_address));

    let stores = Stores {
        config_maps: spawn_reflector(Api::<ConfigMap>::all(client.clone()), "ConfigMap"),
        merge_sources: spawn_reflector(Api::<MergeSource>::all(client.clone()), "MergeSource"),
    };
    stores.config_maps.wait_until_ready().await?;
    stores.merge_sources.wait_until_ready().await?;

    let ctx = Arc::new(Context { client, stores });

    if args.leader_elect {
        run_with_leader_election(ctx, &args).await?;
    } else {
        warn!("Leader election DISABLED - running without high availability");
        run_controllers(ctx, &args).await;
    }

    info!("Graceful shutdown completed");
    Ok(())
}

/// Initialize logging.
///
/// Respects `RUST_LOG` if set, otherwise defaults to INFO level. Respects
/// `RUST_LOG_FORMAT` for the output format (json or text).
fn initialize_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .compact()
                .init();
        }
    }
}

/// Bind addresses accept the ":8080" short form.
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Start the Prometheus metrics HTTP server.
fn start_metrics_server(addr: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        async fn metrics_handler() -> String {
            match metrics::gather_metrics() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to gather metrics: {e}");
                    String::from("# Error gathering metrics\n")
                }
            }
        }

        let app = Router::new().route(METRICS_SERVER_PATH, get(metrics_handler));
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server to {addr}: {e}");
                return;
            }
        };

        info!("Metrics server listening on http://{addr}{METRICS_SERVER_PATH}");
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {e}");
        }
    })
}

/// Start the health probe HTTP server with /healthz and /readyz.
fn start_health_server(addr: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        async fn ping() -> &'static str {
            "ok"
        }

        let app = Router::new()
            .route("/healthz", get(ping))
            .route("/readyz", get(ping));
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind health server to {addr}: {e}");
                return;
            }
        };

        info!("Health server listening on http://{addr}");
        if let Err(e) = axum::serve(listener, app).await {
            error!("Health server error: {e}");
        }
    })
}

/// Spawn a reflector task feeding a store for cross-resource lookups.
fn spawn_reflector<K>(api: Api<K>, kind: &'static str) -> Store<K>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects();

    tokio::spawn(async move {
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            if let Err(err) = event {
                warn!(kind, error = %err, "reflector stream error");
            }
        }
    });

    reader
}

/// Run both controllers until they stop (signal-driven shutdown).
async fn run_controllers(ctx: Arc<Context>, args: &Args) {
    tokio::join!(
        run_merge_source_controller(ctx.clone(), args.merge_source_max_concurrent_reconciles),
        run_merge_target_controller(ctx.clone(), args.merge_target_max_concurrent_reconciles),
    );
}

/// Run the controllers while holding the leader lease; bail when lost.
async fn run_with_leader_election(ctx: Arc<Context>, args: &Args) -> Result<()> {
    let namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| DEFAULT_LEASE_NAMESPACE.to_string());
    let identity = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "cmmc-controller".to_string());

    info!(
        lease = LEASE_NAME,
        namespace = %namespace,
        identity = %identity,
        "Leader election enabled, waiting to acquire leadership..."
    );

    let manager = LeaseManagerBuilder::new(ctx.client.clone(), LEASE_NAME)
        .with_namespace(namespace)
        .with_identity(identity)
        .with_duration(DEFAULT_LEASE_DURATION_SECS)
        .with_grace(DEFAULT_LEASE_GRACE_SECS)
        .build()
        .await?;

    let (mut leader_rx, _lease_handle) = manager.watch().await;
    while !*leader_rx.borrow_and_update() {
        leader_rx.changed().await?;
    }

    info!("Leadership acquired, starting controllers");

    tokio::select! {
        () = run_controllers(ctx, args) => Ok(()),
        result = monitor_leadership(leader_rx) => {
            result?;
            error!("Leadership lost, stepping down");
            anyhow::bail!("leadership lost")
        }
    }
}

/// Returns when leadership is lost or the lease channel errors.
async fn monitor_leadership(mut leader_rx: tokio::sync::watch::Receiver<bool>) -> Result<()> {
    loop {
        leader_rx.changed().await?;
        if !*leader_rx.borrow() {
            return Ok(());
        }
    }
}

/// Run the MergeSource controller.
///
/// Watches MergeSource objects plus, via fan-out, every ConfigMap: a change
/// to a source ConfigMap enqueues each MergeSource named in its watched-by
/// annotation.
async fn run_merge_source_controller(ctx: Arc<Context>, concurrency: u16) {
    info!("Starting MergeSource controller");

    let api = Api::<MergeSource>::all(ctx.client.clone());
    let config_maps = Api::<ConfigMap>::all(ctx.client.clone());

    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .watches(
            config_maps,
            watcher::Config::default(),
            merge_source::watched_by_merge_sources,
        )
        .shutdown_on_signal()
        .run(reconcile_merge_source_wrapper, error_policy_source, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;
}

/// Run the MergeTarget controller.
///
/// Watches MergeTarget objects plus, via fan-out, the managed target
/// ConfigMaps and every MergeSource feeding a target.
async fn run_merge_target_controller(ctx: Arc<Context>, concurrency: u16) {
    info!("Starting MergeTarget controller");

    let api = Api::<MergeTarget>::all(ctx.client.clone());
    let config_maps = Api::<ConfigMap>::all(ctx.client.clone());
    let merge_sources = Api::<MergeSource>::all(ctx.client.clone());

    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .watches(
            config_maps,
            watcher::Config::default(),
            merge_target::managed_by_merge_target,
        )
        .watches(
            merge_sources,
            watcher::Config::default(),
            merge_target::merge_source_target,
        )
        .shutdown_on_signal()
        .run(reconcile_merge_target_wrapper, error_policy_target, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn reconcile_merge_source_wrapper(
    source: Arc<MergeSource>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    merge_source::reconcile_merge_source(source.clone(), ctx)
        .await
        .map_err(|e| {
            error!("Failed to reconcile MergeSource {}: {e:#}", source.name_any());
            ReconcileError::from(e)
        })
}

async fn reconcile_merge_target_wrapper(
    target: Arc<MergeTarget>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    merge_target::reconcile_merge_target(target.clone(), ctx)
        .await
        .map_err(|e| {
            error!("Failed to reconcile MergeTarget {}: {e:#}", target.name_any());
            ReconcileError::from(e)
        })
}

fn error_policy_source(_source: Arc<MergeSource>, _err: &ReconcileError, _ctx: Arc<Context>) -> Action {
    Action::requeue(Duration::from_secs(ERROR_REQUEUE_DURATION_SECS))
}

/// A misconfigured target (ownership conflict) requeues slowly; everything
/// else gets the normal error backoff.
fn error_policy_target(_target: Arc<MergeTarget>, err: &ReconcileError, _ctx: Arc<Context>) -> Action {
    if err.0.downcast_ref::<MisconfiguredTargetError>().is_some() {
        Action::requeue(Duration::from_secs(MISCONFIGURED_REQUEUE_DURATION_SECS))
    } else {
        Action::requeue(Duration::from_secs(ERROR_REQUEUE_DURATION_SECS))
    }
}
