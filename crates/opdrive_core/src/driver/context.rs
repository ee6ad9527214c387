//! Collaborators shared by every driver of one tablet peer.

use crate::apply::ApplyExecutor;
use crate::clock::{Clock, SystemClock};
use crate::commit_log::DurabilityLog;
use crate::config::DriverConfig;
use crate::consensus::ReplicationPort;
use crate::order_verifier::{ApplyOrderVerifier, OrderVerifier};
use crate::prepare::PrepareScheduler;
use crate::stats::DriverStats;
use crate::tracker::DriverRegistry;
use std::sync::Arc;

/// Handles a driver uses to reach the rest of the system.
///
/// Cloning is cheap; every driver of a peer gets a clone of the same context.
#[derive(Clone)]
pub struct DriverContext {
    /// Tracks live drivers.
    pub registry: Arc<dyn DriverRegistry>,
    /// Replicates leader-side rounds.
    pub replication: Arc<dyn ReplicationPort>,
    /// Persists commit records.
    pub log: Arc<dyn DurabilityLog>,
    /// Runs prepare.
    pub prepare: Arc<dyn PrepareScheduler>,
    /// Runs apply.
    pub apply: Arc<dyn ApplyExecutor>,
    /// Checks follower apply order.
    pub order_verifier: Arc<dyn OrderVerifier>,
    /// Assigns hybrid times and bounds commit wait.
    pub clock: Arc<dyn Clock>,
    /// Shared counters.
    pub stats: Arc<DriverStats>,
    /// Per-peer settings.
    pub config: Arc<DriverConfig>,
}

impl DriverContext {
    /// Creates a context with a system clock, a fresh order verifier, fresh
    /// stats and the default configuration.
    pub fn new(
        registry: Arc<dyn DriverRegistry>,
        replication: Arc<dyn ReplicationPort>,
        log: Arc<dyn DurabilityLog>,
        prepare: Arc<dyn PrepareScheduler>,
        apply: Arc<dyn ApplyExecutor>,
    ) -> Self {
        Self {
            registry,
            replication,
            log,
            prepare,
            apply,
            order_verifier: Arc::new(ApplyOrderVerifier::new()),
            clock: Arc::new(SystemClock::default()),
            stats: Arc::new(DriverStats::new()),
            config: Arc::new(DriverConfig::default()),
        }
    }

    /// Replaces the order verifier.
    #[must_use]
    pub fn with_order_verifier(mut self, verifier: Arc<dyn OrderVerifier>) -> Self {
        self.order_verifier = verifier;
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the stats sink.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<DriverStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = Arc::new(config);
        self
    }
}

impl std::fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
