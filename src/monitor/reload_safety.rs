//! Reload gating against engine crash loops.
//!
//! Every reload check walks the same policy, in order:
//!
//! | Step | Condition | Result |
//! |------|-----------|--------|
//! | 1 | inside crash-loop backoff | refuse with remaining time |
//! | 2 | last reload within cooldown | refuse with remaining time |
//! | 3 | restarts in window reach threshold | mark crash loop, refuse |
//! | 4 | otherwise | allow |
//!
//! When the backoff elapses the crash-loop flag and the restart history that
//! triggered it are both cleared.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, saturating_millis};

// ============================================================================
// Constants
// ============================================================================

/// Minimum spacing between reloads.
pub const DEFAULT_RELOAD_COOLDOWN: Duration = Duration::from_secs(2);

/// How long reloads stay refused after a crash loop is detected.
pub const DEFAULT_CRASH_LOOP_BACKOFF: Duration = Duration::from_secs(30);

/// Trailing window for restart history.
pub const DEFAULT_TRACKING_WINDOW: Duration = Duration::from_secs(60);

/// Restarts within the window that count as a crash loop.
pub const DEFAULT_CRASH_LOOP_THRESHOLD: usize = 3;

/// A restart this soon after a reload is logged as likely caused by it.
const CAUSAL_WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// ReloadSafetyConfig
// ============================================================================

/// Reload safety policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSafetyConfig {
    /// Minimum spacing between reloads.
    pub cooldown: Duration,
    /// Refusal period after a crash loop is detected.
    pub crash_loop_backoff: Duration,
    /// Trailing window restarts are counted in.
    pub tracking_window: Duration,
    /// Restart count that marks a crash loop.
    pub crash_loop_threshold: usize,
}

impl ReloadSafetyConfig {
    /// Creates the default policy.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cooldown: DEFAULT_RELOAD_COOLDOWN,
            crash_loop_backoff: DEFAULT_CRASH_LOOP_BACKOFF,
            tracking_window: DEFAULT_TRACKING_WINDOW,
            crash_loop_threshold: DEFAULT_CRASH_LOOP_THRESHOLD,
        }
    }

    /// Sets the reload cooldown.
    #[inline]
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Sets the crash-loop backoff.
    #[inline]
    #[must_use]
    pub fn with_crash_loop_backoff(mut self, backoff: Duration) -> Self {
        self.crash_loop_backoff = backoff;
        self
    }

    /// Sets the restart threshold.
    #[inline]
    #[must_use]
    pub fn with_crash_loop_threshold(mut self, threshold: usize) -> Self {
        self.crash_loop_threshold = threshold;
        self
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero threshold or tracking window.
    pub fn validate(&self) -> Result<()> {
        if self.crash_loop_threshold == 0 {
            return Err(Error::config("crash_loop_threshold must be at least 1"));
        }
        if self.tracking_window.is_zero() {
            return Err(Error::config("tracking_window must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for ReloadSafetyConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Verdict
// ============================================================================

/// Why a reload was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// A crash loop was detected recently.
    CrashLoopBackoff {
        /// Time until reloads are allowed again.
        remaining: Duration,
    },
    /// The previous reload was too recent.
    Cooldown {
        /// Time until the cooldown ends.
        remaining: Duration,
    },
    /// Restarts just crossed the threshold.
    CrashLoopDetected {
        /// Restarts inside the window.
        restarts: usize,
        /// Backoff that now applies.
        backoff: Duration,
    },
}

impl Refusal {
    /// Time until a reload may be attempted.
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        match self {
            Self::CrashLoopBackoff { remaining } | Self::Cooldown { remaining } => *remaining,
            Self::CrashLoopDetected { backoff, .. } => *backoff,
        }
    }
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.retry_after().as_secs_f64().ceil() as u64;
        match self {
            Self::CrashLoopBackoff { .. } | Self::CrashLoopDetected { .. } => {
                write!(f, "system is recovering, try again in {seconds}s")
            }
            Self::Cooldown { .. } => {
                write!(f, "reload cooldown active, try again in {seconds}s")
            }
        }
    }
}

/// Result of a reload safety check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadSafety {
    /// Reload may proceed.
    Safe,
    /// Reload must not be attempted now.
    Refused(Refusal),
}

impl ReloadSafety {
    /// Returns `true` if the reload may proceed.
    #[inline]
    #[must_use]
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Safe)
    }
}

// ============================================================================
// History
// ============================================================================

/// One recorded reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadRecord {
    /// When it happened.
    pub at: Instant,
    /// Whether the engine reported success.
    pub succeeded: bool,
    /// Engine pid at the time, if known.
    pub pid: Option<u32>,
}

/// One recorded engine restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRecord {
    /// When it was observed.
    pub at: Instant,
    /// New engine pid.
    pub pid: u32,
}

/// Point-in-time copy of the monitor's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadSafetySnapshot {
    /// Reloads inside the tracking window, oldest first.
    pub reloads: Vec<ReloadRecord>,
    /// Restarts inside the tracking window, oldest first.
    pub restarts: Vec<RestartRecord>,
    /// When the current crash loop was detected.
    pub crash_loop_since: Option<Instant>,
}

#[derive(Debug, Default)]
struct History {
    reloads: VecDeque<ReloadRecord>,
    restarts: VecDeque<RestartRecord>,
    last_reload: Option<Instant>,
    last_pid: Option<u32>,
    crash_loop_since: Option<Instant>,
}

impl History {
    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .reloads
            .front()
            .is_some_and(|record| now.duration_since(record.at) > window)
        {
            self.reloads.pop_front();
        }
        while self
            .restarts
            .front()
            .is_some_and(|record| now.duration_since(record.at) > window)
        {
            self.restarts.pop_front();
        }
    }

    fn restarts_within(&self, now: Instant, window: Duration) -> usize {
        self.restarts
            .iter()
            .filter(|record| now.duration_since(record.at) <= window)
            .count()
    }
}

// ============================================================================
// ReloadSafetyMonitor
// ============================================================================

/// Gates reloads so the client never feeds an engine crash loop.
///
/// Safe to share between tasks; every method takes `&self`.
#[derive(Debug)]
pub struct ReloadSafetyMonitor {
    config: ReloadSafetyConfig,
    history: Mutex<History>,
}

impl ReloadSafetyMonitor {
    /// Creates a monitor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the policy is invalid.
    pub fn new(config: ReloadSafetyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            history: Mutex::new(History::default()),
        })
    }

    /// Returns the policy.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ReloadSafetyConfig {
        &self.config
    }

    /// Decides whether a reload may be attempted now.
    pub fn check_reload_safety(&self) -> ReloadSafety {
        let now = Instant::now();
        let mut history = self.history.lock();

        if let Some(since) = history.crash_loop_since {
            let elapsed = now.duration_since(since);
            if elapsed < self.config.crash_loop_backoff {
                return ReloadSafety::Refused(Refusal::CrashLoopBackoff {
                    remaining: self.config.crash_loop_backoff - elapsed,
                });
            }
            info!("Crash-loop backoff elapsed, clearing restart history");
            history.crash_loop_since = None;
            history.restarts.clear();
        }

        if let Some(last) = history.last_reload {
            let elapsed = now.duration_since(last);
            if elapsed < self.config.cooldown {
                return ReloadSafety::Refused(Refusal::Cooldown {
                    remaining: self.config.cooldown - elapsed,
                });
            }
        }

        if let Some(refusal) = self.detect_crash_loop(&mut history, now) {
            return ReloadSafety::Refused(refusal);
        }

        ReloadSafety::Safe
    }

    /// Records a reload attempt.
    ///
    /// A failed reload is logged; it does not count toward crash-loop
    /// detection by itself.
    pub fn record_reload_attempt(&self, succeeded: bool, pid: Option<u32>) {
        let now = Instant::now();
        let mut history = self.history.lock();

        history.reloads.push_back(ReloadRecord {
            at: now,
            succeeded,
            pid,
        });
        history.last_reload = Some(now);
        if pid.is_some() {
            history.last_pid = pid;
        }
        history.prune(now, self.config.tracking_window);

        if succeeded {
            debug!(?pid, "Reload recorded");
        } else {
            warn!(?pid, "Reload failed");
        }
    }

    /// Records that the engine process restarted with `pid`.
    ///
    /// A pid equal to the last one seen is not a restart and is ignored.
    pub fn record_service_restart(&self, pid: u32) {
        let now = Instant::now();
        let mut history = self.history.lock();

        if history.last_pid == Some(pid) {
            debug!(pid, "Engine pid unchanged, not a restart");
            return;
        }

        history.restarts.push_back(RestartRecord { at: now, pid });
        history.last_pid = Some(pid);
        history.prune(now, self.config.tracking_window);

        if let Some(last) = history.last_reload
            && now.duration_since(last) <= CAUSAL_WINDOW
        {
            warn!(
                pid,
                since_reload_ms = saturating_millis(now.duration_since(last)),
                "Engine restarted shortly after a reload"
            );
        } else {
            info!(pid, "Engine restart recorded");
        }

        if history.crash_loop_since.is_none() {
            self.detect_crash_loop(&mut history, now);
        }
    }

    /// Returns a copy of the tracked history.
    #[must_use]
    pub fn snapshot(&self) -> ReloadSafetySnapshot {
        let history = self.history.lock();
        ReloadSafetySnapshot {
            reloads: history.reloads.iter().copied().collect(),
            restarts: history.restarts.iter().copied().collect(),
            crash_loop_since: history.crash_loop_since,
        }
    }

    /// Forgets all history.
    pub fn reset(&self) {
        *self.history.lock() = History::default();
        debug!("Reload safety history cleared");
    }

    /// Marks a crash loop if the restart threshold is reached.
    fn detect_crash_loop(&self, history: &mut History, now: Instant) -> Option<Refusal> {
        let restarts = history.restarts_within(now, self.config.tracking_window);
        if restarts < self.config.crash_loop_threshold {
            return None;
        }

        if history.crash_loop_since.is_none() {
            warn!(
                restarts,
                window_s = self.config.tracking_window.as_secs(),
                "Engine crash loop detected, refusing reloads"
            );
            history.crash_loop_since = Some(now);
        }

        Some(Refusal::CrashLoopDetected {
            restarts,
            backoff: self.config.crash_loop_backoff,
        })
    }
}

impl Default for ReloadSafetyMonitor {
    fn default() -> Self {
        Self {
            config: ReloadSafetyConfig::default(),
            history: Mutex::new(History::default()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_fresh_monitor_is_safe() {
        let monitor = ReloadSafetyMonitor::default();
        assert_eq!(monitor.check_reload_safety(), ReloadSafety::Safe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_refuses_second_reload() {
        let monitor = ReloadSafetyMonitor::default();

        monitor.record_reload_attempt(true, Some(100));
        assert!(matches!(
            monitor.check_reload_safety(),
            ReloadSafety::Refused(Refusal::Cooldown { .. })
        ));

        advance(Duration::from_millis(1500)).await;
        monitor.record_reload_attempt(true, Some(100));
        match monitor.check_reload_safety() {
            ReloadSafety::Refused(Refusal::Cooldown { remaining }) => {
                assert_eq!(remaining, Duration::from_secs(2));
            }
            other => panic!("expected cooldown, got {other:?}"),
        }

        advance(Duration::from_millis(2001)).await;
        assert!(monitor.check_reload_safety().is_safe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_loop_detected_then_clears() {
        let monitor = ReloadSafetyMonitor::default();

        for pid in [201, 202, 203] {
            monitor.record_service_restart(pid);
            advance(Duration::from_secs(4)).await;
        }

        match monitor.check_reload_safety() {
            ReloadSafety::Refused(refusal) => {
                assert!(matches!(
                    refusal,
                    Refusal::CrashLoopBackoff { .. } | Refusal::CrashLoopDetected { .. }
                ));
                assert!(refusal.to_string().starts_with("system is recovering"));
            }
            ReloadSafety::Safe => panic!("crash loop not detected"),
        }

        advance(Duration::from_secs(31)).await;
        assert_eq!(monitor.check_reload_safety(), ReloadSafety::Safe);
        assert!(monitor.snapshot().restarts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_on_check_reports_threshold() {
        let monitor = ReloadSafetyMonitor::new(
            ReloadSafetyConfig::new().with_crash_loop_threshold(5),
        )
        .expect("monitor");
        for pid in 1..=4 {
            monitor.record_service_restart(pid);
        }
        assert!(monitor.check_reload_safety().is_safe());

        monitor.record_service_restart(5);
        assert!(monitor.snapshot().crash_loop_since.is_some());
        match monitor.check_reload_safety() {
            ReloadSafety::Refused(Refusal::CrashLoopBackoff { remaining }) => {
                assert_eq!(remaining, DEFAULT_CRASH_LOOP_BACKOFF);
                assert_eq!(
                    Refusal::CrashLoopBackoff { remaining }.to_string(),
                    "system is recovering, try again in 30s"
                );
            }
            other => panic!("expected backoff, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_pid_is_not_a_restart() {
        let monitor = ReloadSafetyMonitor::default();
        monitor.record_reload_attempt(true, Some(42));
        for _ in 0..5 {
            monitor.record_service_restart(42);
        }
        assert!(monitor.snapshot().restarts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reload_alone_is_not_a_crash_loop() {
        let monitor = ReloadSafetyMonitor::default();
        for _ in 0..5 {
            monitor.record_reload_attempt(false, Some(7));
            advance(Duration::from_secs(3)).await;
        }
        assert!(monitor.check_reload_safety().is_safe());
        assert_eq!(monitor.snapshot().reloads.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_pruned_to_window() {
        let monitor = ReloadSafetyMonitor::default();
        monitor.record_service_restart(1);
        monitor.record_service_restart(2);
        advance(Duration::from_secs(61)).await;
        monitor.record_service_restart(3);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.restarts.len(), 1);
        assert_eq!(snapshot.restarts[0].pid, 3);
        assert!(monitor.check_reload_safety().is_safe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let monitor = ReloadSafetyMonitor::default();
        for pid in 1..=3 {
            monitor.record_service_restart(pid);
        }
        assert!(!monitor.check_reload_safety().is_safe());

        monitor.reset();
        assert!(monitor.check_reload_safety().is_safe());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        assert!(
            ReloadSafetyMonitor::new(ReloadSafetyConfig::new().with_crash_loop_threshold(0))
                .is_err()
        );
    }
}
