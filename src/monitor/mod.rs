//! Engine supervision policies.
//!
//! Neither monitor owns a task or a socket. A supervisor calls them from
//! whatever context observes the engine and acts on their verdicts.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ReloadSafetyMonitor`] | Refuses reloads during cooldown or crash loops |
//! | [`ServiceHealthMonitor`] | Health checks, restart backoff, recovery choice |
//! | [`ProcessInspector`] | Engine process queries (supplied by the caller) |
//! | [`StatusProbe`] | Socket liveness check, implemented by `TransportClient` |

// ============================================================================
// Submodules
// ============================================================================

/// Service health and recovery decisions.
pub mod health;

/// Reload gating.
pub mod reload_safety;

// ============================================================================
// Re-exports
// ============================================================================

pub use health::{
    HealthConfig, HealthSnapshot, HealthStatus, ProcessInspector, RecoveryAction,
    ServiceHealthMonitor, StatusProbe,
};
pub use reload_safety::{
    Refusal, ReloadRecord, ReloadSafety, ReloadSafetyConfig, ReloadSafetyMonitor,
    ReloadSafetySnapshot, RestartRecord,
};
