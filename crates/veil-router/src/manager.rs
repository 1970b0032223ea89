//! Background maintenance tasks

use rand::Rng;
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, info};
use veil_protocol::types::now_millis;

use crate::router::Router;

/// How often pending builds and tests are checked against their deadlines
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

impl Router {
    /// Spawn the management and sweep loops
    ///
    /// Management runs every `manage_interval_secs` plus up to a second of
    /// jitter: pool reconciliation, tunnel tests, housekeeping and flushing
    /// queued traffic.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.write().await;
        if !tasks.is_empty() {
            debug!("Router {} already running", self.local_ident());
            return;
        }

        let router = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let base = Duration::from_secs(router.config().tunnels.manage_interval_secs);
            let test_interval = router.config().tunnels.test_interval_secs * 1000;
            let mut last_test = 0u64;

            loop {
                let now = now_millis();
                router.reconcile_all(now).await;
                if now.saturating_sub(last_test) >= test_interval {
                    router.run_tests(now).await;
                    last_test = now;
                }
                router.maintain(now).await;
                router.flush_all().await;

                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Tunnel manager shutting down");
                        break;
                    }
                    _ = sleep(base + jitter) => {}
                }
            }
        }));

        let router = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Build sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let timed_out = router.sweep_all(now_millis()).await;
                        if timed_out > 0 {
                            debug!("{} builds or tests timed out", timed_out);
                        }
                    }
                }
            }
        }));

        info!("Router {} started", self.local_ident());
    }

    /// Stop the background loops and wait for them, then drop all state
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<_> = self.tasks.write().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.clear().await;
    }

    /// Flush every destination's outbound queue
    pub async fn flush_all(&self) -> usize {
        let mut sent = 0;
        for destination in self.destination_idents() {
            sent += self.flush_outbound(&destination).await;
        }
        sent
    }
}
