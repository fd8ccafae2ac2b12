//! Per-instance tick loop.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use super::{Worker, lease_name, run_worker_tick};
use crate::store::EphemeralStore;

/// Ticks a fixed set of workers on their intervals until shut down.
///
/// Each worker gets its own task, so a slow handler never delays another
/// worker's tick. Ticks missed while a handler overran are skipped rather than
/// bunched up.
#[derive(Debug)]
pub struct WorkerScheduler {
    store: Arc<dyn EphemeralStore>,
    instance_id: String,
    workers: Vec<Arc<dyn Worker>>,
}

impl WorkerScheduler {
    /// A scheduler taking leases in `store` as `instance_id`.
    pub fn new(store: Arc<dyn EphemeralStore>, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            workers: Vec::new(),
        }
    }

    /// Add a worker.
    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Add several workers.
    pub fn with_workers(mut self, workers: impl IntoIterator<Item = Arc<dyn Worker>>) -> Self {
        self.workers.extend(workers);
        self
    }

    /// Names of the registered workers, in registration order.
    pub fn worker_names(&self) -> Vec<&'static str> {
        self.workers.iter().map(|w| w.name()).collect()
    }

    /// Tick every worker until `shutdown` resolves, then wait for in-flight
    /// ticks and hand held leases back.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for worker in &self.workers {
            tracing::info!(
                worker = worker.name(),
                interval_secs = worker.interval().as_secs(),
                "starting worker"
            );
            tasks.spawn(tick_loop(
                worker.clone(),
                self.store.clone(),
                self.instance_id.clone(),
                stop_rx.clone(),
            ));
        }

        shutdown.await;
        tracing::info!(instance_id = %self.instance_id, "stopping workers");
        // Receivers only observe the change; a send error means they are all gone.
        let _ = stop_tx.send(true);

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "worker task aborted");
            }
        }

        for worker in &self.workers {
            match self
                .store
                .release_lease(&lease_name(worker.name()), &self.instance_id)
                .await
            {
                Ok(true) => tracing::debug!(worker = worker.name(), "lease released"),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(worker = worker.name(), error = %err, "lease release failed")
                }
            }
        }
    }
}

async fn tick_loop(
    worker: Arc<dyn Worker>,
    store: Arc<dyn EphemeralStore>,
    instance_id: String,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(worker.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_worker_tick(worker.as_ref(), store.as_ref(), &instance_id).await;
            }
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }
    }
}
