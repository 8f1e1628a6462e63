//! Error types for the engine link.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use kanata_link::{Result, TransportClient};
//!
//! async fn example(client: &TransportClient) -> Result<()> {
//!     let names = client.layer_names().await?;
//!     client.change_layer(&names[0]).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Protocol | [`Error::InvalidResponse`], [`Error::CapabilityUnsupported`], [`Error::Protocol`], [`Error::MessageTooLarge`] |
//! | Execution | [`Error::Engine`], [`Error::Timeout`] |
//! | External | [`Error::Io`], [`Error::Json`] |
//!
//! Connection-level failures and timeouts are recovered once inside the
//! transport client by discarding the connection. Everything in the protocol
//! category always surfaces to the caller.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;
use std::time::Duration;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client, listener or monitor configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Socket-level connection failure.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// TCP connect did not complete in time.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The engine closed the socket.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Unparseable or structurally wrong payload.
    #[error("Invalid response: {message}")]
    InvalidResponse {
        /// Description of what was wrong.
        message: String,
    },

    /// Handshake succeeded but a required capability or protocol version is missing.
    #[error("Capability unsupported: {missing:?} (protocol {protocol})")]
    CapabilityUnsupported {
        /// Capabilities the server did not advertise.
        missing: Vec<String>,
        /// Protocol version reported by the server.
        protocol: u32,
    },

    /// Protocol violation while awaiting a correlated response.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Accumulated bytes exceeded the line limit without a delimiter.
    #[error("Message exceeds {limit} bytes without a line delimiter")]
    MessageTooLarge {
        /// Configured maximum line length in bytes.
        limit: usize,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// The engine answered with an error status.
    ///
    /// Application-level; the connection stays usable.
    #[error("Engine error: {message}")]
    Engine {
        /// Engine-provided message.
        message: String,
    },

    /// Operation timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout: Duration) -> Self {
        Self::ConnectionTimeout {
            timeout_ms: saturating_millis(timeout),
        }
    }

    /// Creates an invalid response error.
    #[inline]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    /// Creates a capability error.
    #[inline]
    pub fn capability_unsupported(missing: Vec<String>, protocol: u32) -> Self {
        Self::CapabilityUnsupported { missing, protocol }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a message too large error.
    #[inline]
    pub fn message_too_large(limit: usize) -> Self {
        Self::MessageTooLarge { limit }
    }

    /// Creates an engine error.
    #[inline]
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: saturating_millis(timeout),
        }
    }
}

/// Whole milliseconds in `duration`, clamped to `u64::MAX`.
#[inline]
#[must_use]
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Timeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::Io(_)
        )
    }

    /// Returns `true` if the connection that produced this error must be
    /// discarded before the next call.
    ///
    /// Timeouts, socket failures and an overflowing read buffer leave the
    /// stream in an unknown position. Application-level errors do not.
    #[inline]
    #[must_use]
    pub fn should_discard_connection(&self) -> bool {
        self.is_timeout() || self.is_connection_error() || matches!(self, Self::MessageTooLarge { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on a single retry over a fresh connection.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.is_timeout() || self.is_connection_error()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("refused");
        assert_eq!(err.to_string(), "Connection failed: refused");
    }

    #[test]
    fn test_capability_display() {
        let err = Error::capability_unsupported(vec!["reload".into()], 1);
        assert_eq!(
            err.to_string(),
            "Capability unsupported: [\"reload\"] (protocol 1)"
        );
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::timeout("status", Duration::from_secs(5));
        let other_err = Error::connection("test");

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_discard_policy() {
        assert!(Error::ConnectionClosed.should_discard_connection());
        assert!(Error::connection_timeout(Duration::from_millis(100)).should_discard_connection());
        assert!(Error::timeout("reload", Duration::from_secs(5)).should_discard_connection());

        assert!(!Error::invalid_response("garbage").should_discard_connection());
        assert!(!Error::engine("unknown layer").should_discard_connection());
        assert!(!Error::capability_unsupported(vec![], 0).should_discard_connection());
        assert!(!Error::protocol("too many skipped lines").should_discard_connection());
        assert!(Error::message_too_large(65536).should_discard_connection());
        assert!(!Error::message_too_large(65536).is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::ConnectionReset, "reset");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(!err.should_discard_connection());
    }

    #[test]
    fn test_timeout_millis_saturate() {
        let err = Error::timeout("reload", Duration::MAX);
        assert!(matches!(err, Error::Timeout { timeout_ms: u64::MAX, .. }));

        let err = Error::connection_timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Connection timeout after 1500ms");
        assert_eq!(saturating_millis(Duration::from_micros(999)), 0);
    }
}
