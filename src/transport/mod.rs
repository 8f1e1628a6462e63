//! TCP transport to the engine control socket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                              ┌─────────────────┐
//! │  TransportClient │      one request at a time   │  Remapping      │
//! │  EventListener   │◄────────────────────────────►│  engine         │
//! │                  │   127.0.0.1:PORT, NDJSON     │  (TCP server)   │
//! └──────────────────┘                              └─────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `LineStream::connect` - Open the socket with a connect timeout
//! 2. `LineStream::send` - Write one JSON line
//! 3. `LineStream::read_line` - Return one line, keeping any trailing bytes
//! 4. `LineStream::shutdown` - Close the write direction
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `client` | Correlated request/response client |
//! | `framer` | Newline framing over a byte buffer |
//! | `stream` | Framed TCP stream halves |

// ============================================================================
// Submodules
// ============================================================================

/// Request/response client.
pub mod client;

/// Newline framing.
pub mod framer;

/// Framed TCP stream.
pub mod stream;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{ConnectionState, FakeKeyOutcome, ReloadOutcome, ReloadResponse, TransportClient};
pub use framer::{DELIMITER, LineFramer};
pub use stream::{LineReader, LineStream, LineWriter};
