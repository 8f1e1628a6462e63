//! Kanata Link - Reliable control core for the Kanata remapping engine.
//!
//! This library talks to a running engine over its loopback TCP protocol
//! (newline-delimited JSON) and supervises the engine process.
//!
//! # Architecture
//!
//! The engine is the server; this crate is always the client:
//!
//! - **Transport Client**: one correlated request at a time, single retry,
//!   broadcasts skipped
//! - **Event Listener**: long-lived stream, layer polling, typed callbacks
//! - **Monitors**: pure policy objects for reload gating and recovery
//!
//! Key design principles:
//!
//! - Each [`TransportClient`] and [`EventListener`] owns its own socket
//! - Every request carries a `request_id`; unmatched lines are skipped
//! - Timeouts and socket failures discard the connection; engine errors don't
//! - Reload failure is a value ([`ReloadOutcome`]), not an error
//!
//! # Quick Start
//!
//! ```no_run
//! use kanata_link::{ClientConfig, ReloadOutcome, ReloadSafetyMonitor, Result, TransportClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = TransportClient::new(ClientConfig::new(37001))?;
//!     client.require_capabilities(&["reload"]).await?;
//!
//!     let safety = ReloadSafetyMonitor::default();
//!     if safety.check_reload_safety().is_safe() {
//!         let outcome = client.reload(true, 5000).await;
//!         safety.record_reload_attempt(outcome.is_success(), None);
//!         if let ReloadOutcome::Failure { reason, .. } = outcome {
//!             eprintln!("reload failed: {reason}");
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Client and listener configuration |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Request correlation ids |
//! | [`listener`] | Streaming event listener |
//! | [`monitor`] | Reload safety and service health |
//! | [`protocol`] | Wire message types |
//! | [`transport`] | Line framing, TCP stream, request client |

// ============================================================================
// Modules
// ============================================================================

/// Client and listener configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Request correlation identifiers.
pub mod identifiers;

/// Streaming event listener.
pub mod listener;

/// Supervision policies.
pub mod monitor;

/// Engine wire protocol message types.
pub mod protocol;

/// TCP transport layer.
///
/// Line framing, the framed stream and the request/response client.
pub mod transport;

#[cfg(test)]
mod test_support;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use config::{ClientConfig, ListenerConfig};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{RequestId, RequestIdGenerator};

// Listener types
pub use listener::{EventListener, ListenerState};

// Monitor types
pub use monitor::{
    HealthConfig, HealthStatus, ProcessInspector, RecoveryAction, Refusal, ReloadSafety,
    ReloadSafetyConfig, ReloadSafetyMonitor, ServiceHealthMonitor, StatusProbe,
};

// Protocol types
pub use protocol::{
    ActionUri, ActivationEvent, FakeKeyAction, KeyAction, KeyInputEvent, ParsedEvent,
    ServerHello, StatusInfo,
};

// Transport types
pub use transport::{ConnectionState, FakeKeyOutcome, ReloadOutcome, TransportClient};
