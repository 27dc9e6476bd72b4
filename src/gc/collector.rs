//! Garbage Collector
//!
//! Leader-elected, load-gated sweeping. Every instance runs the same loop;
//! the `gc_lock` lease decides which one sweeps.
//!
//! ```text
//! Follower --lease acquired--> Leader --load ok--> Sweeping --> Leader
//!    ^                            |
//!    +------lease refused---------+
//! any --connectivity lost--> Disabled --restored--> Follower
//! any --shutdown--> Stopped
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::lifecycle::Lifecycle;
use super::load::LoadProbe;
use super::sweep::{SweepReport, Sweeper};
use crate::config::{Config, GcConfig, RetryPolicy, TokenScheme};
use crate::error::{CacheError, Result};
use crate::keyspace::Keyspace;
use crate::lease::LeaseManager;
use crate::naming::BucketNamespace;

/// Lease resource the collectors of one environment contend for.
pub const GC_LOCK_RESOURCE: &str = "gc_lock";

// == GC State ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GcState {
    Follower,
    Leader,
    Sweeping,
    Disabled,
    Stopped,
}

impl fmt::Display for GcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcState::Follower => "follower",
            GcState::Leader => "leader",
            GcState::Sweeping => "sweeping",
            GcState::Disabled => "disabled",
            GcState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Result of one leadership attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another token holds the lease
    Follower,
    /// Leader, but the host was too busy to sweep
    Skipped,
    Swept(SweepReport),
}

/// Aborts the renewal task when dropped, so renewal ends with the sweep.
struct RenewalGuard(JoinHandle<()>);

impl Drop for RenewalGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// == Garbage Collector ==
pub struct GarbageCollector {
    keyspace: Arc<Keyspace>,
    leases: LeaseManager,
    sweeper: Arc<Sweeper>,
    probe: Arc<dyn LoadProbe>,
    config: GcConfig,
    retry: RetryPolicy,
    token: String,
    state: watch::Sender<GcState>,
    lifecycle: Option<mpsc::UnboundedSender<Lifecycle>>,
}

impl GarbageCollector {
    // == Constructor ==
    pub fn new(
        keyspace: Arc<Keyspace>,
        namespace: &BucketNamespace,
        config: GcConfig,
        retry: RetryPolicy,
        probe: Arc<dyn LoadProbe>,
    ) -> Self {
        let sweeper = Sweeper::new(
            keyspace.clone(),
            namespace,
            config.regular_batch_size,
            config.global_batch_size,
        );
        let (state, _) = watch::channel(GcState::Follower);
        Self {
            leases: LeaseManager::new(keyspace.clone(), namespace.env()),
            sweeper: Arc::new(sweeper),
            token: session_token(config.token_scheme, namespace.app()),
            keyspace,
            probe,
            config,
            retry,
            state,
            lifecycle: None,
        }
    }

    pub fn from_config(keyspace: Arc<Keyspace>, config: &Config, probe: Arc<dyn LoadProbe>) -> Self {
        let namespace = BucketNamespace::new(&config.environment, &config.app_name);
        Self::new(keyspace, &namespace, config.gc.clone(), config.retry, probe)
    }

    /// Sends lifecycle messages to a supervisor.
    pub fn with_lifecycle(mut self, sender: mpsc::UnboundedSender<Lifecycle>) -> Self {
        self.lifecycle = Some(sender);
        self
    }

    /// Token stored in the lease while this collector leads.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn state(&self) -> watch::Receiver<GcState> {
        self.state.subscribe()
    }

    fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.config.lease_duration_ms)
    }

    fn set_state(&self, next: GcState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "GC state change");
        }
    }

    fn emit(&self, message: Lifecycle) {
        if let Some(sender) = &self.lifecycle {
            // A closed channel means the supervisor is gone; keep collecting
            let _ = sender.send(message);
        }
    }

    // == Cycle ==
    /// One pass of the main loop: take or renew the lease, then sweep unless
    /// the host is too busy. The lease is renewed only while the sweep runs.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let acquired = self
            .leases
            .acquire_or_renew(GC_LOCK_RESOURCE, &self.token, self.lease_duration())
            .await?;
        if !acquired {
            self.set_state(GcState::Follower);
            return Ok(CycleOutcome::Follower);
        }

        self.set_state(GcState::Leader);
        if !self.load_permits_sweep().await {
            self.emit(Lifecycle::Skipped);
            return Ok(CycleOutcome::Skipped);
        }

        let renewal = self.spawn_renewal();
        self.set_state(GcState::Sweeping);
        let swept = self.sweeper.sweep().await;
        drop(renewal);
        self.set_state(GcState::Leader);

        match swept {
            Ok(report) => {
                info!(
                    buckets = report.visited.len(),
                    removed = report.members_removed,
                    deleted = report.buckets_deleted.len(),
                    failed = report.failed,
                    "Sweep complete"
                );
                self.emit(Lifecycle::Completed);
                Ok(CycleOutcome::Swept(report))
            }
            Err(CacheError::BackendUnavailable) => Err(CacheError::BackendUnavailable),
            Err(error) => Err(CacheError::Sweep(error.to_string())),
        }
    }

    async fn load_permits_sweep(&self) -> bool {
        match self.probe.cpu_usage().await {
            Ok(usage) if usage < self.config.cpu_load_cutoff => true,
            Ok(usage) => {
                info!(
                    usage,
                    cutoff = self.config.cpu_load_cutoff,
                    "Host CPU load at or above cutoff, skipping sweep"
                );
                false
            }
            Err(error) => {
                warn!(error = %error, "CPU load probe failed, skipping sweep");
                false
            }
        }
    }

    /// Keeps the lease alive while the cycle runs.
    fn spawn_renewal(&self) -> RenewalGuard {
        let leases = self.leases.clone();
        let token = self.token.clone();
        let duration = self.lease_duration();
        let period = Duration::from_millis(
            self.config
                .lease_duration_ms
                .saturating_sub(self.config.renewal_margin_ms)
                .max(1),
        );

        RenewalGuard(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match leases.acquire_or_renew(GC_LOCK_RESOURCE, &token, duration).await {
                    Ok(true) => debug!("GC lease renewed"),
                    Ok(false) => {
                        let lost = CacheError::LeaseLost(GC_LOCK_RESOURCE.to_string());
                        warn!(error = %lost, "Stopping lease renewal");
                        break;
                    }
                    Err(error) => debug!(error = %error, "GC lease renewal failed"),
                }
            }
        }))
    }

    // == Main Loop ==
    /// Runs until `shutdown` turns true, then releases the lease best-effort.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            token = %self.token,
            lease_duration_ms = self.config.lease_duration_ms,
            cpu_load_cutoff = self.config.cpu_load_cutoff,
            "Starting garbage collector"
        );
        self.emit(Lifecycle::Started);
        let mut connectivity = self.keyspace.connectivity();

        loop {
            if *shutdown.borrow() {
                break;
            }
            if !self.keyspace.is_available() {
                self.set_state(GcState::Disabled);
                if !self.wait_for_connectivity(&mut shutdown).await {
                    break;
                }
                self.set_state(GcState::Follower);
                continue;
            }

            self.emit(Lifecycle::Running);
            let cycle = tokio::select! {
                outcome = self.run_cycle() => Some(outcome),
                _ = connectivity_lost(&mut connectivity) => {
                    self.set_state(GcState::Disabled);
                    continue;
                }
                _ = shutdown.changed() => None,
            };
            match cycle {
                None => break,
                Some(Ok(outcome)) => debug!(?outcome, "GC cycle finished"),
                Some(Err(CacheError::BackendUnavailable)) => continue,
                Some(Err(error)) => error!(error = %error, "GC cycle failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.lease_duration()) => {}
                _ = connectivity_lost(&mut connectivity) => self.set_state(GcState::Disabled),
                _ = shutdown.changed() => {}
            }
        }

        self.stop().await;
    }

    /// Waits, paced by the retry policy, for connectivity to return.
    ///
    /// Returns false if shutdown was requested first.
    async fn wait_for_connectivity(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut connectivity = self.keyspace.connectivity();
        let started = Instant::now();
        let mut attempt: u32 = 1;
        let mut exhausted = false;
        warn!("Backing store unavailable, garbage collector disabled");

        loop {
            if *connectivity.borrow_and_update() {
                info!(attempts = attempt, "Backing store available, garbage collector resuming");
                return true;
            }
            if *shutdown.borrow() {
                return false;
            }

            let delay = match self.retry.delay(attempt, started.elapsed()) {
                Some(delay) => delay,
                None => {
                    if !exhausted {
                        error!(
                            attempts = attempt - 1,
                            max_attempts = self.retry.max_attempts,
                            max_retry_time_ms = self.retry.max_retry_time_ms,
                            "Connection retries exhausted, waiting for connectivity"
                        );
                        exhausted = true;
                    }
                    Duration::from_millis(self.retry.max_retry_time_ms.max(1))
                }
            };

            tokio::select! {
                _ = connectivity.changed() => {}
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }

    async fn stop(&self) {
        self.set_state(GcState::Stopped);
        match self.leases.release(GC_LOCK_RESOURCE, &self.token).await {
            Ok(true) => info!("GC lease released"),
            Ok(false) => info!("GC lease not held, nothing to release"),
            Err(error) => warn!(error = %error, "Failed to release GC lease"),
        }
        self.emit(Lifecycle::Terminated);
    }
}

/// Resolves once the backing store is reported unavailable.
async fn connectivity_lost(connectivity: &mut watch::Receiver<bool>) {
    if connectivity.wait_for(|available| !*available).await.is_err() {
        // Keyspace dropped; nothing left to observe
        std::future::pending::<()>().await;
    }
}

/// Derives the lease token for `app` under `scheme`.
pub fn session_token(scheme: TokenScheme, app: &str) -> String {
    match scheme {
        TokenScheme::Application => app.to_string(),
        TokenScheme::Process => format!(
            "{}:{}:{}",
            app,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ),
    }
}
