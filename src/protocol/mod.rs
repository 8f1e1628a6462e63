//! Engine wire protocol message types.
//!
//! Newline-delimited JSON over a loopback TCP socket. Each message is a single
//! JSON object whose one top-level key names the message kind.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `ClientMessage` | Local → Engine | Correlated request |
//! | `Reply` | Engine → Local | Response or acknowledgement |
//! | broadcast | Engine → Local | Unsolicited notification |
//! | `ParsedEvent` | Engine → Listener | Typed event stream |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `action` | Action URI parser for push messages |
//! | `event` | Listener event decoding |
//! | `message` | Outgoing request kinds |
//! | `response` | Reply decoding and broadcast classification |

// ============================================================================
// Submodules
// ============================================================================

/// Action URI parser.
pub mod action;

/// Listener event types.
pub mod event;

/// Outgoing request kinds.
pub mod message;

/// Reply types and line classification.
pub mod response;

// ============================================================================
// Re-exports
// ============================================================================

pub use action::{ActionUri, UriForm, title_case};
pub use event::{ActivationEvent, KeyAction, KeyInputEvent, LayerSource, ParsedEvent};
pub use message::{ClientMessage, FakeKeyAction};
pub use response::{
    AckStatus, BROADCAST_KINDS, CurrentLayerName, HelloShape, Incoming, LastReload, LayerNames,
    ReloadResult, Reply, ServerHello, StatusAck, StatusInfo, classify_line, is_broadcast_kind,
};
