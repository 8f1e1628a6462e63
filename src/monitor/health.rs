//! Engine process health and recovery decisions.
//!
//! # Health Check
//!
//! 1. Process not running: unhealthy, restart
//! 2. Inside the startup grace period: healthy without probing
//! 3. Otherwise probe `status` up to `probe_attempts` times
//! 4. All probes failed: unhealthy, restart unless still inside grace
//!
//! # Restart Backoff
//!
//! `interval = min(backoff_max, backoff_base * multiplier^(attempts - 1))`
//!
//! | Attempt | Interval |
//! |---------|----------|
//! | 1 | 2s |
//! | 2 | 4s |
//! | 3 | 8s |
//! | 4 | 16s |
//! | 5+ | 30s |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::error::{Error, Result, saturating_millis};
use crate::transport::TransportClient;

// ============================================================================
// Constants
// ============================================================================

/// Window after a start in which failed probes are not trusted.
pub const DEFAULT_TCP_GRACE: Duration = Duration::from_secs(10);

/// Status probes per health check.
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 3;

/// Pause between status probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// First restart backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Restart backoff growth factor.
pub const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// Restart backoff cap.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Start attempts before giving up.
pub const DEFAULT_MAX_START_ATTEMPTS: u32 = 5;

/// Recovery retries before giving up.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Connection failures that call for a full recovery.
pub const DEFAULT_CONNECTION_FAILURE_THRESHOLD: u32 = 10;

// ============================================================================
// Collaborators
// ============================================================================

/// Answers questions about the engine process.
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// Returns `true` if the engine process is running.
    async fn is_running(&self) -> bool;

    /// Returns the engine pid, if running.
    async fn pid(&self) -> Option<u32>;

    /// Returns `true` if another engine instance holds the engine's resources.
    async fn has_conflicting_instance(&self) -> bool;
}

/// Lightweight liveness check against the engine socket.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    /// Succeeds if the engine answered.
    async fn probe_status(&self) -> Result<()>;

    /// Releases any connection held for probing.
    async fn release(&self);
}

#[async_trait]
impl StatusProbe for TransportClient {
    async fn probe_status(&self) -> Result<()> {
        self.status().await.map(|_| ())
    }

    async fn release(&self) {
        self.close().await;
    }
}

// ============================================================================
// HealthConfig
// ============================================================================

/// Health and restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// Probe grace period after a start.
    pub tcp_grace: Duration,
    /// Probes per check.
    pub probe_attempts: u32,
    /// Pause between probes.
    pub probe_interval: Duration,
    /// First restart backoff.
    pub backoff_base: Duration,
    /// Backoff growth factor.
    pub backoff_multiplier: u32,
    /// Backoff cap.
    pub backoff_max: Duration,
    /// Start attempts before giving up.
    pub max_start_attempts: u32,
    /// Recovery retries before giving up.
    pub max_retry_attempts: u32,
    /// Connection failures that call for a full recovery.
    pub connection_failure_threshold: u32,
}

impl HealthConfig {
    /// Creates the default policy.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tcp_grace: DEFAULT_TCP_GRACE,
            probe_attempts: DEFAULT_PROBE_ATTEMPTS,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            backoff_max: DEFAULT_BACKOFF_MAX,
            max_start_attempts: DEFAULT_MAX_START_ATTEMPTS,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            connection_failure_threshold: DEFAULT_CONNECTION_FAILURE_THRESHOLD,
        }
    }

    /// Sets the startup grace period.
    #[inline]
    #[must_use]
    pub fn with_tcp_grace(mut self, grace: Duration) -> Self {
        self.tcp_grace = grace;
        self
    }

    /// Sets probe count and spacing.
    #[inline]
    #[must_use]
    pub fn with_probes(mut self, attempts: u32, interval: Duration) -> Self {
        self.probe_attempts = attempts;
        self.probe_interval = interval;
        self
    }

    /// Required wait after `attempts` start attempts.
    ///
    /// Zero attempts need no wait.
    #[must_use]
    pub fn backoff_interval(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.saturating_pow(attempts - 1);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero probes, zero limits or a multiplier
    /// below 1.
    pub fn validate(&self) -> Result<()> {
        if self.probe_attempts == 0 {
            return Err(Error::config("probe_attempts must be at least 1"));
        }
        if self.backoff_multiplier == 0 {
            return Err(Error::config("backoff_multiplier must be at least 1"));
        }
        if self.max_start_attempts == 0
            || self.max_retry_attempts == 0
            || self.connection_failure_threshold == 0
        {
            return Err(Error::config("Recovery limits must be at least 1"));
        }
        Ok(())
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// HealthStatus
// ============================================================================

/// Outcome of one health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    /// Engine considered healthy.
    pub healthy: bool,
    /// Explanation.
    pub reason: String,
    /// A restart is recommended.
    pub should_restart: bool,
    /// When the check finished.
    pub timestamp: SystemTime,
}

impl HealthStatus {
    /// Healthy status.
    #[must_use]
    pub fn healthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: true,
            reason: reason.into(),
            should_restart: false,
            timestamp: SystemTime::now(),
        }
    }

    /// Unhealthy status.
    #[must_use]
    pub fn unhealthy(reason: impl Into<String>, should_restart: bool) -> Self {
        Self {
            healthy: false,
            reason: reason.into(),
            should_restart,
            timestamp: SystemTime::now(),
        }
    }
}

// ============================================================================
// RecoveryAction
// ============================================================================

/// What the supervisor should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing.
    None,
    /// Stop retrying and tell the user.
    GiveUp {
        /// Why recovery stopped.
        reason: String,
    },
    /// Restart companion drivers as well as the engine.
    FullRecovery,
    /// Kill the conflicting instance, then restart.
    KillAndRestart,
    /// Restart the engine.
    Restart,
}

impl RecoveryAction {
    /// Returns `true` if recovery requires user intervention.
    #[inline]
    #[must_use]
    pub fn is_give_up(&self) -> bool {
        matches!(self, Self::GiveUp { .. })
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("no action needed"),
            Self::GiveUp { reason } => write!(f, "{reason}; manual intervention required"),
            Self::FullRecovery => f.write_str("restart drivers and engine"),
            Self::KillAndRestart => f.write_str("stop conflicting instance and restart engine"),
            Self::Restart => f.write_str("restart engine"),
        }
    }
}

// ============================================================================
// Counters
// ============================================================================

/// Point-in-time copy of the monitor's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Start attempts since the last success.
    pub start_attempts: u32,
    /// Recovery retries since the last success.
    pub retry_attempts: u32,
    /// Consecutive connection failures.
    pub connection_failures: u32,
    /// Last start attempt.
    pub last_attempt: Option<Instant>,
    /// Last start, anchoring the grace period.
    pub last_start: Option<Instant>,
}

// ============================================================================
// ServiceHealthMonitor
// ============================================================================

/// Decides engine health and the recovery to apply.
///
/// Counters are internally synchronized; every method takes `&self`.
pub struct ServiceHealthMonitor {
    config: HealthConfig,
    inspector: Arc<dyn ProcessInspector>,
    probe: Arc<dyn StatusProbe>,
    counters: Mutex<HealthSnapshot>,
}

impl fmt::Debug for ServiceHealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHealthMonitor")
            .field("config", &self.config)
            .field("counters", &*self.counters.lock())
            .finish_non_exhaustive()
    }
}

impl ServiceHealthMonitor {
    /// Creates a monitor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the policy is invalid.
    pub fn new(
        config: HealthConfig,
        inspector: Arc<dyn ProcessInspector>,
        probe: Arc<dyn StatusProbe>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inspector,
            probe,
            counters: Mutex::new(HealthSnapshot::default()),
        })
    }

    /// Returns the policy.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Returns a copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        *self.counters.lock()
    }

    /// Checks engine health.
    pub async fn check_service_health(&self) -> HealthStatus {
        if !self.inspector.is_running().await {
            warn!("Engine process is not running");
            return HealthStatus::unhealthy("engine process is not running", true);
        }

        if self.in_grace_period() {
            debug!("Engine inside startup grace period, skipping probe");
            return HealthStatus::healthy("engine starting, inside grace period");
        }

        let attempts = self.config.probe_attempts;
        for attempt in 1..=attempts {
            match self.probe.probe_status().await {
                Ok(()) => return HealthStatus::healthy("engine answered status probe"),
                Err(e) => {
                    debug!(attempt, attempts, error = %e, "Status probe failed");
                    if attempt < attempts {
                        sleep(self.config.probe_interval).await;
                    }
                }
            }
        }

        if self.in_grace_period() {
            info!("Status probes failed during grace period, waiting");
            return HealthStatus::unhealthy("engine not answering yet, inside grace period", false);
        }

        warn!(attempts, "Engine did not answer status probes");
        HealthStatus::unhealthy(
            format!("engine did not answer {attempts} status probes"),
            true,
        )
    }

    /// Required wait after `attempts` start attempts.
    #[inline]
    #[must_use]
    pub fn backoff_interval(&self, attempts: u32) -> Duration {
        self.config.backoff_interval(attempts)
    }

    /// Returns `true` once the backoff for the current attempt count elapsed.
    #[must_use]
    pub fn can_restart_service(&self) -> bool {
        let counters = self.counters.lock();
        let Some(last) = counters.last_attempt else {
            return true;
        };

        let required = self.config.backoff_interval(counters.start_attempts);
        let elapsed = last.elapsed();
        if elapsed < required {
            debug!(
                attempts = counters.start_attempts,
                wait_ms = saturating_millis(required - elapsed),
                "Restart still in backoff"
            );
            return false;
        }
        true
    }

    /// Records a start attempt and anchors the grace period.
    pub fn record_start_attempt(&self) {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        counters.start_attempts = counters.start_attempts.saturating_add(1);
        counters.last_attempt = Some(now);
        counters.last_start = Some(now);
        info!(attempt = counters.start_attempts, "Engine start attempt");
    }

    /// Records a confirmed start.
    pub fn record_start_success(&self) {
        let mut counters = self.counters.lock();
        counters.start_attempts = 0;
        counters.retry_attempts = 0;
        counters.connection_failures = 0;
        info!("Engine started");
    }

    /// Records a failed start. Counters are kept so backoff keeps growing.
    pub fn record_start_failure(&self, reason: &str) {
        let attempts = self.counters.lock().start_attempts;
        warn!(attempts, reason, "Engine start failed");
    }

    /// Records a recovery retry.
    pub fn record_retry_attempt(&self) {
        let mut counters = self.counters.lock();
        counters.retry_attempts = counters.retry_attempts.saturating_add(1);
        debug!(retries = counters.retry_attempts, "Recovery retry");
    }

    /// Records a companion connection failure.
    ///
    /// Returns `true` once failures reach the threshold.
    pub fn record_connection_failure(&self) -> bool {
        let mut counters = self.counters.lock();
        counters.connection_failures = counters.connection_failures.saturating_add(1);
        let reached = counters.connection_failures >= self.config.connection_failure_threshold;
        if reached {
            warn!(
                failures = counters.connection_failures,
                "Connection failure threshold reached"
            );
        }
        reached
    }

    /// Clears the companion connection failure count.
    pub fn record_connection_success(&self) {
        self.counters.lock().connection_failures = 0;
    }

    /// Picks the recovery for `status`.
    pub async fn determine_recovery_action(&self, status: &HealthStatus) -> RecoveryAction {
        if !status.should_restart {
            return RecoveryAction::None;
        }

        let counters = self.snapshot();
        if counters.start_attempts >= self.config.max_start_attempts {
            return RecoveryAction::GiveUp {
                reason: format!(
                    "engine failed to start after {} attempts",
                    counters.start_attempts
                ),
            };
        }
        if counters.retry_attempts >= self.config.max_retry_attempts {
            return RecoveryAction::GiveUp {
                reason: format!(
                    "recovery failed after {} retries",
                    counters.retry_attempts
                ),
            };
        }
        if counters.connection_failures >= self.config.connection_failure_threshold {
            return RecoveryAction::FullRecovery;
        }
        if self.inspector.has_conflicting_instance().await {
            let pid = self.inspector.pid().await;
            warn!(?pid, "Conflicting engine instance detected");
            return RecoveryAction::KillAndRestart;
        }
        RecoveryAction::Restart
    }

    /// Zeroes every counter and releases the probe connection.
    pub async fn reset_monitoring_state(&self) {
        *self.counters.lock() = HealthSnapshot::default();
        self.probe.release().await;
        debug!("Health monitoring state reset");
    }

    fn in_grace_period(&self) -> bool {
        self.counters
            .lock()
            .last_start
            .is_some_and(|start| start.elapsed() < self.config.tcp_grace)
    }
}

// ============================================================================
// Tests
// ============================================================================
