//! Driver and collaborator configuration.

use std::time::Duration;

/// What to do when a failure is discovered after an operation was committed
/// by a quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Log and abort the process.
    #[default]
    Abort,
    /// Log and panic the current thread.
    Panic,
}

/// Configuration for transaction drivers.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Tablet the drivers operate on, used in log prefixes.
    pub tablet_id: String,

    /// Local peer, used in log prefixes.
    pub peer_id: String,

    /// Upper bound on a single commit wait.
    pub commit_wait_timeout: Duration,

    /// Handling of post-commit failures.
    pub fatal_policy: FatalPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tablet_id: String::from("tablet-0"),
            peer_id: String::from("peer-0"),
            commit_wait_timeout: Duration::from_secs(1),
            fatal_policy: FatalPolicy::Abort,
        }
    }
}

impl DriverConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the tablet id.
    #[must_use]
    pub fn tablet_id(mut self, tablet_id: impl Into<String>) -> Self {
        self.tablet_id = tablet_id.into();
        self
    }

    /// Sets the peer id.
    #[must_use]
    pub fn peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = peer_id.into();
        self
    }

    /// Sets the commit wait bound.
    #[must_use]
    pub const fn commit_wait_timeout(mut self, timeout: Duration) -> Self {
        self.commit_wait_timeout = timeout;
        self
    }

    /// Sets the post-commit failure policy.
    #[must_use]
    pub const fn fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.fatal_policy = policy;
        self
    }
}

/// Configuration for the prepare thread.
#[derive(Debug, Clone, Copy)]
pub struct PrepareConfig {
    /// Maximum number of drivers waiting to be prepared.
    pub queue_capacity: usize,

    /// Maximum number of leader-side rounds submitted in one replication
    /// call. A value of 1 disables batching.
    pub max_batch_size: usize,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            max_batch_size: 64,
        }
    }
}

impl PrepareConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the queue capacity.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the maximum batch size.
    #[must_use]
    pub const fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Returns true if leader-side rounds are batched.
    #[must_use]
    pub const fn batching_enabled(&self) -> bool {
        self.max_batch_size > 1
    }
}

/// Configuration for the apply thread pool.
#[derive(Debug, Clone, Copy)]
pub struct ApplyPoolConfig {
    /// Number of worker threads.
    pub threads: usize,

    /// Maximum number of queued apply tasks.
    pub queue_capacity: usize,
}

impl Default for ApplyPoolConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            queue_capacity: 10_000,
        }
    }
}

impl ApplyPoolConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub const fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Sets the queue capacity.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// Configuration for the transaction tracker.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerConfig {
    /// Maximum number of live drivers. `None` means unbounded.
    pub max_pending: Option<usize>,
}

impl TrackerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of live drivers.
    #[must_use]
    pub const fn max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }
}
