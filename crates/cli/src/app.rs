//! Builds every component from configuration and runs them until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, warn};

use listener::{Ed25519Verifier, ListenerState};
use orchestrator::{
    restore_scores, shutdown_channel, DagExecutor, Evaluator, Gateway, ShutdownTx,
    StakeRefresher, WeightPublisher,
};
use routing::{
    ContainsAnswerGrader, Identity, RateLimiter, ScoreStore, StakeDirectory, UsageTracker,
    WeightBoard, WeightSink,
};
use state_store::{FileQuestionBank, JsonFileStore};
use worker_client::{
    build_client, HttpStakeSource, HttpWeightSink, HttpWorkerInvoker, WorkerRegistry,
};

use crate::config::SwitchboardConfig;

/// Runs the service until Ctrl-C.
///
/// # Errors
///
/// Fails on startup problems: unreadable persisted state, an unbindable
/// listen address, or an HTTP client that cannot be built.
pub async fn run(config: SwitchboardConfig) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let client = build_client(config.connect_timeout()).context("failed to build HTTP client")?;

    // Shared state cells.
    let caller_stakes = Arc::new(StakeDirectory::new());
    let worker_trust = Arc::new(StakeDirectory::new());
    let scores = Arc::new(ScoreStore::new(config.evaluation.window_size));
    let usage = Arc::new(UsageTracker::new(config.usage_time_constant()));
    let weights = Arc::new(WeightBoard::new());
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit.clone(),
        caller_stakes.clone(),
    ));

    // Persistence and restore.
    let store = Arc::new(JsonFileStore::new(&config.state_dir));
    restore_scores(store.as_ref(), &scores, &usage)
        .await
        .context("failed to restore score state")?;

    let registry = Arc::new(WorkerRegistry::new(config.workers.clone()));
    let configured_workers: Vec<Identity> = registry.identities();
    let invoker = Arc::new(HttpWorkerInvoker::new(client.clone(), registry.clone()));

    let mut publisher = WeightPublisher::new(
        scores.clone(),
        worker_trust.clone(),
        usage.clone(),
        weights.clone(),
        store.clone(),
        configured_workers.clone(),
    );
    if let Some(url) = &config.weight_sink_url {
        let sink: Arc<dyn WeightSink> = Arc::new(HttpWeightSink::new(client.clone(), url.clone()));
        publisher = publisher.with_sink(sink);
    }
    publisher
        .restore()
        .await
        .context("failed to restore weight snapshot")?;

    // Request path.
    let executor = Arc::new(
        DagExecutor::new(invoker.clone(), config.executor.clone())
            .with_usage_tracker(usage.clone()),
    );
    let gateway = Arc::new(Gateway::new(
        Arc::new(Ed25519Verifier),
        limiter.clone(),
        executor,
    ));

    let mut jobs = JoinSet::new();

    // Background jobs.
    let refresh_every = Duration::from_secs(config.stake_refresh.interval_secs);
    match &config.caller_stake_url {
        Some(url) => {
            let refresher = StakeRefresher::new(
                "caller_stakes",
                Arc::new(HttpStakeSource::new(client.clone(), url.clone())),
                caller_stakes.clone(),
            )
            .with_limiter(limiter.clone());
            jobs.spawn(refresher.run(refresh_every, shutdown_rx.clone()));
        }
        None => warn!("No caller_stake_url configured; every identified caller gets the no-stake budget"),
    }
    match &config.worker_trust_url {
        Some(url) => {
            let refresher = StakeRefresher::new(
                "worker_trust",
                Arc::new(HttpStakeSource::new(client.clone(), url.clone())),
                worker_trust.clone(),
            );
            jobs.spawn(refresher.run(refresh_every, shutdown_rx.clone()));
        }
        None => warn!("No worker_trust_url configured; trust scores stay at zero"),
    }

    let bank = FileQuestionBank::load(&config.questions_path)
        .await
        .context("failed to load evaluation questions")?;
    let evaluator = Evaluator::new(
        invoker,
        Arc::new(bank),
        Arc::new(ContainsAnswerGrader),
        scores.clone(),
        usage.clone(),
        store.clone(),
        configured_workers,
        config.evaluation.call_timeout(),
    )
    .with_credential(config.evaluation_api_key.clone());
    jobs.spawn(evaluator.run(
        Duration::from_secs(config.evaluation.interval_secs),
        shutdown_rx.clone(),
    ));
    jobs.spawn(publisher.run(
        Duration::from_secs(config.publication.interval_secs),
        shutdown_rx.clone(),
    ));

    // HTTP surface.
    let tcp = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let state = ListenerState {
        gateway,
        weights,
    };
    let server = tokio::spawn(listener::serve(tcp, state, shutdown_rx));

    info!(
        workers = registry.len(),
        listen_addr = %config.listen_addr,
        "Switchboard started"
    );

    wait_for_ctrl_c(&shutdown_tx).await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "Listener stopped with an error"),
        Err(err) => warn!(error = %err, "Listener task failed"),
    }
    while let Some(joined) = jobs.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "Background job failed");
        }
    }
    info!("Switchboard stopped");
    Ok(())
}

async fn wait_for_ctrl_c(shutdown: &ShutdownTx) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Cannot listen for Ctrl-C; shutting down");
    }
    info!("Shutdown requested");
    shutdown.send_replace(true);
}
