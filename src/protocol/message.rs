//! Outgoing client messages.
//!
//! Every message is a single JSON object whose one top-level key names the
//! message kind. All kinds carry a `request_id` so the engine can echo it.
//!
//! # Format
//!
//! ```json
//! {"Reload":{"wait":true,"timeout_ms":5000,"request_id":5}}
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identifiers::RequestId;

// ============================================================================
// FakeKeyAction
// ============================================================================

/// Action to perform on an engine virtual key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FakeKeyAction {
    /// Press and hold.
    Press,
    /// Release a held key.
    Release,
    /// Press then release.
    Tap,
    /// Flip between pressed and released.
    Toggle,
}

impl FakeKeyAction {
    /// Returns the wire name.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Press => "Press",
            Self::Release => "Release",
            Self::Tap => "Tap",
            Self::Toggle => "Toggle",
        }
    }
}

impl fmt::Display for FakeKeyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ClientMessage
// ============================================================================

/// A request from this client to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClientMessage {
    /// Capability handshake.
    Hello {
        /// Correlation id.
        request_id: RequestId,
    },

    /// Engine readiness, uptime and last reload outcome.
    Status {
        /// Correlation id.
        request_id: RequestId,
    },

    /// List configured layer names.
    RequestLayerNames {
        /// Correlation id.
        request_id: RequestId,
    },

    /// Name of the active layer.
    RequestCurrentLayerName {
        /// Correlation id.
        request_id: RequestId,
    },

    /// Reload the configuration file.
    Reload {
        /// Block until the engine is ready again.
        wait: bool,
        /// Server-side wait budget.
        timeout_ms: u64,
        /// Correlation id.
        request_id: RequestId,
    },

    /// Drive a virtual key.
    ActOnFakeKey {
        /// Virtual key name.
        name: String,
        /// Action to apply.
        action: FakeKeyAction,
        /// Correlation id.
        request_id: RequestId,
    },

    /// Switch the active layer.
    ChangeLayer {
        /// Target layer name.
        new: String,
        /// Correlation id.
        request_id: RequestId,
    },
}

impl ClientMessage {
    /// Returns the correlation id carried by this message.
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Hello { request_id }
            | Self::Status { request_id }
            | Self::RequestLayerNames { request_id }
            | Self::RequestCurrentLayerName { request_id }
            | Self::Reload { request_id, .. }
            | Self::ActOnFakeKey { request_id, .. }
            | Self::ChangeLayer { request_id, .. } => *request_id,
        }
    }

    /// Returns the message kind, as it appears on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::Status { .. } => "Status",
            Self::RequestLayerNames { .. } => "RequestLayerNames",
            Self::RequestCurrentLayerName { .. } => "RequestCurrentLayerName",
            Self::Reload { .. } => "Reload",
            Self::ActOnFakeKey { .. } => "ActOnFakeKey",
            Self::ChangeLayer { .. } => "ChangeLayer",
        }
    }

    /// Serializes the message followed by the newline delimiter.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] if serialization fails.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

// ============================================================================
// Tests
// ============================================================================
