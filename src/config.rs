//! Connection configuration.
//!
//! Process-wide settings are limited to where the engine listens and how long
//! to wait for it. Each client or listener is constructed with its own copy.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use kanata_link::ClientConfig;
//!
//! let config = ClientConfig::new(37001)
//!     .with_request_timeout(Duration::from_secs(3))
//!     .with_strict_correlation(false);
//!
//! config.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Engine listens on loopback only.
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Default engine TCP port.
pub const DEFAULT_PORT: u16 = 37001;

/// Overall budget for one request/response exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for the TCP connect itself.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Fixed pause before the single retry.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(150);

/// Lines skipped while waiting for a correlated response before giving up.
pub const DEFAULT_MAX_SKIPPED_LINES: usize = 50;

/// Read buffer cap without a delimiter.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// How long to wait for a `ReloadResult` line after a bare `Ok` status.
pub const DEFAULT_RELOAD_RESULT_GRACE: Duration = Duration::from_secs(1);

/// Listener state poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Listener pause between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// ClientConfig
// ============================================================================

/// Request/response client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Engine address.
    pub host: IpAddr,

    /// Engine TCP port.
    pub port: u16,

    /// Overall timeout applied to each exchange.
    pub request_timeout: Duration,

    /// TCP connect timeout.
    pub connect_timeout: Duration,

    /// Pause before the single retry after a connection failure or timeout.
    pub retry_backoff: Duration,

    /// Maximum non-matching lines tolerated per request.
    pub max_skipped_lines: usize,

    /// Maximum bytes buffered without a newline.
    pub max_line_bytes: usize,

    /// Grace period for a follow-up `ReloadResult` line.
    ///
    /// A waiting reload adds its own `timeout_ms` to this.
    pub reload_result_grace: Duration,

    /// Skip tagged responses that carry no `request_id`.
    ///
    /// Disable for engines that never echo ids.
    pub strict_correlation: bool,
}

impl ClientConfig {
    /// Creates a configuration for the given port with production defaults.
    #[inline]
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self {
            host: DEFAULT_HOST,
            port,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_skipped_lines: DEFAULT_MAX_SKIPPED_LINES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            reload_result_grace: DEFAULT_RELOAD_RESULT_GRACE,
            strict_correlation: true,
        }
    }

    /// Sets the engine host.
    #[inline]
    #[must_use]
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Sets the overall request timeout.
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the TCP connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the retry backoff.
    #[inline]
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the skipped line cap.
    #[inline]
    #[must_use]
    pub fn with_max_skipped_lines(mut self, max: usize) -> Self {
        self.max_skipped_lines = max;
        self
    }

    /// Sets the read buffer cap.
    #[inline]
    #[must_use]
    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    /// Sets the grace period for the follow-up reload result line.
    #[inline]
    #[must_use]
    pub fn with_reload_result_grace(mut self, grace: Duration) -> Self {
        self.reload_result_grace = grace;
        self
    }

    /// Enables or disables strict correlation.
    #[inline]
    #[must_use]
    pub fn with_strict_correlation(mut self, strict: bool) -> Self {
        self.strict_correlation = strict;
        self
    }

    /// Returns the socket address of the engine.
    #[inline]
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero port, zero timeouts or zero caps.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config("Engine port must be non-zero"));
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(Error::config("Timeouts must be greater than zero"));
        }
        if self.max_skipped_lines == 0 {
            return Err(Error::config("max_skipped_lines must be at least 1"));
        }
        if self.max_line_bytes == 0 {
            return Err(Error::config("max_line_bytes must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

// ============================================================================
// ListenerConfig
// ============================================================================

/// Event listener configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Engine address.
    pub host: IpAddr,

    /// TCP connect timeout.
    pub connect_timeout: Duration,

    /// Interval between state queries.
    pub poll_interval: Duration,

    /// Pause after a stream error before reconnecting.
    pub reconnect_delay: Duration,

    /// Maximum bytes buffered without a newline.
    pub max_line_bytes: usize,
}

impl ListenerConfig {
    /// Creates a configuration with production defaults.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            host: DEFAULT_HOST,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    /// Sets the engine host.
    #[inline]
    #[must_use]
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Sets the state poll interval.
    #[inline]
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the reconnect delay.
    #[inline]
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when an interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() || self.reconnect_delay.is_zero() {
            return Err(Error::config("Listener intervals must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config("Connect timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
