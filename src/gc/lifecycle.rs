//! Collector Worker
//!
//! Runs a [`GarbageCollector`] as a worker task next to a monitor task that
//! logs its lifecycle messages and forwards them to any observer. A crashed
//! worker is reported, not restarted.

use std::fmt;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::collector::{GarbageCollector, GcState};

/// Lifecycle messages a collector sends to its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Started,
    Running,
    Completed,
    /// The host was too busy; this cycle did not sweep
    Skipped,
    Terminated,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Lifecycle::Started => "GC process started.",
            Lifecycle::Running => "Running GC.",
            Lifecycle::Completed => "GC completed.",
            Lifecycle::Skipped => "GC skipped, host load above cutoff.",
            Lifecycle::Terminated => "GC process terminated.",
        };
        f.write_str(message)
    }
}

// == Collector Handle ==
pub struct CollectorHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<GcState>,
    events: broadcast::Sender<Lifecycle>,
    worker: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl CollectorHandle {
    /// Observes the collector's state.
    pub fn state(&self) -> watch::Receiver<GcState> {
        self.state.clone()
    }

    /// Receives lifecycle messages sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Lifecycle> {
        self.events.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Signals the worker to release its lease and exit, then waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.worker.await {
            error!(error = %error, "Garbage collector worker failed");
        }
        if let Err(error) = self.monitor.await {
            error!(error = %error, "Garbage collector monitor failed");
        }
    }
}

/// Spawns `collector` as a worker task and returns its handle.
pub fn spawn_collector(collector: GarbageCollector) -> CollectorHandle {
    let (lifecycle_tx, mut lifecycle_rx) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (events, _) = broadcast::channel(64);
    let collector = collector.with_lifecycle(lifecycle_tx);
    let state = collector.state();

    let forward = events.clone();
    let monitor = tokio::spawn(async move {
        // Ends once the worker drops its sender, whether it exited or crashed
        while let Some(message) = lifecycle_rx.recv().await {
            info!(lifecycle = %message, "Garbage collector lifecycle");
            let _ = forward.send(message);
        }
        info!("Garbage collector worker exited");
    });
    let worker = tokio::spawn(collector.run(shutdown_rx));

    CollectorHandle {
        shutdown,
        state,
        events,
        worker,
        monitor,
    }
}
