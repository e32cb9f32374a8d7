//! Orchestrator (C9): bind, wait for workers, run one inference, shut down.

use crate::config::CoordinatorConfig;
use crate::dispatch::{DispatchEngine, TaskTimeouts};
use crate::error::{CoordinatorError, Result};
use crate::handler;
use crate::input::InputSource;
use crate::model::{LayerConfig, QuantParams};
use crate::registry::WorkerRegistry;
use crate::stats::{LayerStats, StatsCollector};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Run exactly one inference pass: bind, accept `workers` registrations,
/// dispatch every configured layer, broadcast SHUTDOWN, return per-layer
/// stats.
pub async fn run(
    config: &CoordinatorConfig,
    layers: Vec<LayerConfig>,
    quant: Vec<QuantParams>,
    input_source: &dyn InputSource,
) -> Result<Vec<LayerStats>> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| CoordinatorError::BindFailed {
            addr: addr.clone(),
            source,
        })?;
    info!(addr, "listening");

    let registry = Arc::new(WorkerRegistry::new());
    let stop_accept = Arc::new(Notify::new());

    let heartbeat_registry = registry.clone();
    let heartbeat_period = config.heartbeat_period();
    let heartbeat_liveness = config.effective_heartbeat_liveness();
    let heartbeat_task = tokio::spawn(async move {
        heartbeat_registry
            .heartbeat_monitor(heartbeat_period, heartbeat_liveness)
            .await;
    });

    let accept_registry = registry.clone();
    let accept_stop = stop_accept.clone();
    let registration_timeout = config.registration_timeout();
    let accept_task = tokio::spawn(async move {
        let mut handlers: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!(%peer, "accepted connection");
                            let registry = accept_registry.clone();
                            handlers.spawn(async move {
                                handler::handle_connection(registry, stream, registration_timeout).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = accept_stop.notified() => break,
            }
        }
        while handlers.join_next().await.is_some() {}
    });

    let result = run_inference(config, &registry, layers, quant, input_source).await;

    stop_accept.notify_one();
    heartbeat_task.abort();
    if let Err(e) = accept_task.await {
        warn!(error = %e, "accept loop task failed to join");
    }

    result
}

async fn run_inference(
    config: &CoordinatorConfig,
    registry: &Arc<WorkerRegistry>,
    layers: Vec<LayerConfig>,
    quant: Vec<QuantParams>,
    input_source: &dyn InputSource,
) -> Result<Vec<LayerStats>> {
    registry
        .wait_for_workers(config.workers, config.registration_deadline())
        .await?;
    info!(workers = config.workers, "all workers registered");

    let input = input_source.load()?;
    let timeouts = TaskTimeouts {
        header: config.task_header_timeout(),
        payload: config.task_payload_timeout(),
    };
    let engine = DispatchEngine::new(registry.clone(), layers, quant, timeouts);

    let mut stats = StatsCollector::new();
    let outcome = engine.execute_inference(input, &mut stats).await;
    stats.log_summary();

    match outcome {
        Ok(_) => {
            engine.broadcast_shutdown().await;
            Ok(stats.into_vec())
        }
        Err(e) => Err(e),
    }
}
