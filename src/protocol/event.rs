//! Event message types.
//!
//! Events are lines the engine sends on the long-lived listener connection:
//! broadcasts, answers to the listener's own state poll and handshake, and
//! input notifications.
//!
//! # Event Types
//!
//! | Kind | Payload |
//! |------|---------|
//! | `LayerChange` | `new` |
//! | `CurrentLayerName` | `name` (poll answer) |
//! | `MessagePush` | `message`: string or array of strings |
//! | `KeyInput` | `key`, `action` (`press`/`release`/`repeat`), `t` |
//! | `HoldActivated` / `TapActivated` | `key`, `action`, `t` |
//! | `HelloOk` | advertised capabilities |
//! | `ConfigFileReload` / `Ready` / `ConfigError` | lifecycle broadcasts |

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::Value;

use super::response::ServerHello;

// ============================================================================
// Payloads
// ============================================================================

/// Physical key transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    /// Key went down.
    #[serde(alias = "Press")]
    Press,
    /// Key went up.
    #[serde(alias = "Release")]
    Release,
    /// Auto-repeat while held.
    #[serde(alias = "Repeat")]
    Repeat,
}

/// Key input notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyInputEvent {
    /// Engine key name.
    pub key: String,
    /// Transition.
    pub action: KeyAction,
    /// Engine timestamp in milliseconds.
    #[serde(default, rename = "t")]
    pub timestamp_ms: u64,
}

/// Tap-hold key resolution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActivationEvent {
    /// Engine key name.
    pub key: String,
    /// Resulting action, as the engine describes it.
    pub action: String,
    /// Engine timestamp in milliseconds.
    #[serde(default, rename = "t")]
    pub timestamp_ms: u64,
}

/// Where a layer name came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSource {
    /// `LayerChange` broadcast.
    Change,
    /// Answer to the state poll.
    Poll,
}

// ============================================================================
// ParsedEvent
// ============================================================================

/// Parsed event types for type-safe handling.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    /// Active layer reported.
    Layer {
        /// Layer name.
        name: String,
        /// Delta broadcast or poll answer.
        source: LayerSource,
    },

    /// Push message.
    MessagePush {
        /// String payloads, in order.
        messages: Vec<String>,
        /// Original `message` value.
        raw: Value,
    },

    /// Key input.
    KeyInput(KeyInputEvent),

    /// Tap-hold key resolved as hold.
    HoldActivated(ActivationEvent),

    /// Tap-hold key resolved as tap.
    TapActivated(ActivationEvent),

    /// Handshake answer with advertised capabilities.
    Hello(ServerHello),

    /// Engine reloaded its configuration file.
    ConfigFileReload {
        /// New configuration path, if reported.
        path: Option<String>,
    },

    /// Engine finished starting.
    Ready,

    /// Engine rejected its configuration.
    ConfigError {
        /// Engine error text.
        message: String,
    },

    /// Anything else.
    Unknown {
        /// Top-level tag, if the line was an object with one.
        kind: Option<String>,
        /// Original line.
        raw: String,
    },
}

#[derive(Deserialize)]
enum WireEvent {
    LayerChange {
        new: String,
    },
    CurrentLayerName {
        name: String,
    },
    MessagePush {
        message: Value,
    },
    KeyInput(KeyInputEvent),
    HoldActivated(ActivationEvent),
    TapActivated(ActivationEvent),
    ConfigFileReload {
        #[serde(default)]
        new: Option<String>,
    },
    Ready {},
    ConfigError {
        #[serde(default)]
        msg: String,
    },
}

// ============================================================================
// Event Parsing Implementation
// ============================================================================

impl ParsedEvent {
    /// Parses one listener line.
    ///
    /// Never fails; lines that are not recognized become [`ParsedEvent::Unknown`].
    #[must_use]
    pub fn from_line(line: &str) -> Self {
        let trimmed = line.trim();
        let unknown = |kind: Option<String>| Self::Unknown {
            kind,
            raw: trimmed.to_string(),
        };

        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return unknown(None);
        };

        if let Some(hello) = ServerHello::from_value(&value) {
            return Self::Hello(hello);
        }

        let kind = value
            .as_object()
            .and_then(|object| object.keys().next())
            .cloned();

        match WireEvent::deserialize(value) {
            Ok(WireEvent::LayerChange { new }) => Self::Layer {
                name: new,
                source: LayerSource::Change,
            },
            Ok(WireEvent::CurrentLayerName { name }) => Self::Layer {
                name,
                source: LayerSource::Poll,
            },
            Ok(WireEvent::MessagePush { message }) => Self::MessagePush {
                messages: push_strings(&message),
                raw: message,
            },
            Ok(WireEvent::KeyInput(event)) => Self::KeyInput(event),
            Ok(WireEvent::HoldActivated(event)) => Self::HoldActivated(event),
            Ok(WireEvent::TapActivated(event)) => Self::TapActivated(event),
            Ok(WireEvent::ConfigFileReload { new }) => Self::ConfigFileReload { path: new },
            Ok(WireEvent::Ready {}) => Self::Ready,
            Ok(WireEvent::ConfigError { msg }) => Self::ConfigError { message: msg },
            Err(_) => unknown(kind),
        }
    }
}

/// Extracts string payloads from a push message.
fn push_strings(message: &Value) -> Vec<String> {
    match message {
        Value::String(text) => vec![text.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// Tests
// ============================================================================
