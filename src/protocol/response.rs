//! Incoming engine lines, as seen by the request/response client.
//!
//! Each line is classified as either an unsolicited broadcast or a reply.
//! Replies are decoded into explicit types; a known kind with the wrong
//! structure is an invalid response rather than a guess.
//!
//! # Reply Kinds
//!
//! | Kind | Shape |
//! |------|-------|
//! | `HelloOk` | rich (`version`, `protocol`, `capabilities`) or minimal (`server`, `capabilities`) |
//! | `StatusInfo` | `engine_version`, `uptime_s`, `ready`, `last_reload` |
//! | `LayerNames` | `names` |
//! | `CurrentLayerName` | `name` |
//! | `ReloadResult` | `ready`, `timeout_ms`, `ok`, `duration_ms`, `epoch` |
//! | `{"status": ...}` | generic acknowledgement |
//! | `Error` | engine-side failure with `msg` |

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashSet;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Constants
// ============================================================================

/// Closed set of unsolicited message kinds.
///
/// A line tagged with one of these is never a response to a request.
pub const BROADCAST_KINDS: [&str; 5] = [
    "LayerChange",
    "ConfigFileReload",
    "MessagePush",
    "Ready",
    "ConfigError",
];

/// Protocol version assumed for engines that answer with the minimal hello.
pub const MINIMAL_HELLO_PROTOCOL: u32 = 1;

/// Upper bound on how much of an offending line is echoed into errors.
const MAX_ECHOED_BYTES: usize = 200;

/// Returns `true` if `kind` is a broadcast message kind.
#[inline]
#[must_use]
pub fn is_broadcast_kind(kind: &str) -> bool {
    BROADCAST_KINDS.contains(&kind)
}

// ============================================================================
// ServerHello
// ============================================================================

/// Which `HelloOk` shape the engine answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloShape {
    /// Version, protocol and capabilities.
    Rich,
    /// Server name and capabilities only.
    Minimal,
}

/// Handshake result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    /// Engine version, or the server name for minimal answers.
    pub server_version: String,
    /// Protocol version.
    pub protocol: u32,
    /// Advertised capabilities.
    pub capabilities: FxHashSet<String>,
    /// Echoed correlation id.
    pub request_id: Option<RequestId>,
    /// Shape the engine used.
    pub shape: HelloShape,
}

#[derive(Deserialize)]
struct RichHello {
    version: String,
    protocol: u32,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    request_id: Option<RequestId>,
}

#[derive(Deserialize)]
struct MinimalHello {
    server: String,
    capabilities: Vec<String>,
    #[serde(default)]
    request_id: Option<RequestId>,
}

impl ServerHello {
    /// Decodes a hello from a whole line value.
    ///
    /// Accepts `{"HelloOk":{...}}` in either shape, or the untagged minimal
    /// object. Returns `None` if the value is not hello-shaped at all.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if let Some(body) = object.get("HelloOk") {
            return Self::from_body(body);
        }
        if object.contains_key("server") && object.contains_key("capabilities") {
            return Self::from_body(value);
        }
        None
    }

    fn from_body(body: &Value) -> Option<Self> {
        if let Ok(rich) = RichHello::deserialize(body) {
            return Some(Self {
                server_version: rich.version,
                protocol: rich.protocol,
                capabilities: rich.capabilities.into_iter().collect(),
                request_id: rich.request_id,
                shape: HelloShape::Rich,
            });
        }

        MinimalHello::deserialize(body).ok().map(|minimal| Self {
            server_version: minimal.server,
            protocol: MINIMAL_HELLO_PROTOCOL,
            capabilities: minimal.capabilities.into_iter().collect(),
            request_id: minimal.request_id,
            shape: HelloShape::Minimal,
        })
    }

    /// Returns `true` if the capability was advertised.
    #[inline]
    #[must_use]
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Checks that a protocol version and every required capability are present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapabilityUnsupported`] listing what is missing.
    pub fn require(&self, required: &[&str]) -> Result<()> {
        let missing: Vec<String> = required
            .iter()
            .filter(|capability| !self.supports(capability))
            .map(|capability| (*capability).to_string())
            .collect();

        if self.protocol == 0 || !missing.is_empty() {
            return Err(Error::capability_unsupported(missing, self.protocol));
        }
        Ok(())
    }
}

// ============================================================================
// Reply Payloads
// ============================================================================

/// Outcome of the most recent reload, as reported by `StatusInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LastReload {
    /// Whether it succeeded.
    pub ok: bool,
    /// Engine-formatted timestamp.
    #[serde(default)]
    pub at: Option<String>,
}

/// Engine status.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusInfo {
    /// Engine version.
    pub engine_version: String,
    /// Seconds since the engine started.
    #[serde(default)]
    pub uptime_s: u64,
    /// Whether the engine is processing input.
    pub ready: bool,
    /// Last reload outcome, if any reload happened.
    #[serde(default)]
    pub last_reload: Option<LastReload>,
    /// Echoed correlation id.
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

/// Layer name list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LayerNames {
    /// Configured layer names.
    pub names: Vec<String>,
    /// Echoed correlation id.
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

/// Active layer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CurrentLayerName {
    /// Layer name.
    pub name: String,
    /// Echoed correlation id.
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

/// Structured reload outcome.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReloadResult {
    /// Engine is ready on the new configuration.
    pub ready: bool,
    /// Wait budget the engine applied.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Whether the configuration parsed.
    #[serde(default)]
    pub ok: Option<bool>,
    /// How long the reload took.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Configuration epoch after the reload.
    #[serde(default)]
    pub epoch: Option<u64>,
    /// Echoed correlation id.
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

/// Generic acknowledgement status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AckStatus {
    /// Request accepted.
    Ok,
    /// Request rejected.
    Error,
}

/// Generic `{"status": "Ok" | "Error", "msg": ...}` acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusAck {
    /// Outcome.
    pub status: AckStatus,
    /// Error text.
    #[serde(default)]
    pub msg: Option<String>,
    /// Echoed correlation id.
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

impl StatusAck {
    /// Returns `true` if the engine accepted the request.
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }

    /// Returns the error message, or a placeholder if the engine sent none.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.msg
            .clone()
            .unwrap_or_else(|| "engine reported an error".to_string())
    }
}

#[derive(Deserialize)]
struct EngineError {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    request_id: Option<RequestId>,
}

#[derive(Deserialize)]
enum TaggedReply {
    StatusInfo(StatusInfo),
    LayerNames(LayerNames),
    CurrentLayerName(CurrentLayerName),
    ReloadResult(ReloadResult),
}

// ============================================================================
// Reply
// ============================================================================

/// A non-broadcast line from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Handshake answer.
    Hello(ServerHello),
    /// Status answer.
    StatusInfo(StatusInfo),
    /// Layer names answer.
    LayerNames(LayerNames),
    /// Current layer answer.
    CurrentLayerName(CurrentLayerName),
    /// Structured reload answer.
    ReloadResult(ReloadResult),
    /// Generic acknowledgement.
    Ack(StatusAck),
    /// Engine-side failure (`{"Error":{"msg":...}}`).
    EngineError {
        /// Error text.
        msg: String,
        /// Echoed correlation id.
        request_id: Option<RequestId>,
    },
    /// A well-formed message of a kind this client does not consume.
    Other {
        /// Top-level tag.
        kind: String,
        /// Echoed correlation id, if the body had one.
        request_id: Option<RequestId>,
    },
}

impl Reply {
    /// Returns the echoed correlation id.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Hello(hello) => hello.request_id,
            Self::StatusInfo(info) => info.request_id,
            Self::LayerNames(names) => names.request_id,
            Self::CurrentLayerName(current) => current.request_id,
            Self::ReloadResult(result) => result.request_id,
            Self::Ack(ack) => ack.request_id,
            Self::EngineError { request_id, .. } | Self::Other { request_id, .. } => *request_id,
        }
    }

    /// Returns `true` for replies that are always direct answers to the last
    /// request, even without a `request_id`.
    ///
    /// The engine never broadcasts status acknowledgements or `Error` lines.
    #[inline]
    #[must_use]
    pub fn is_direct_answer(&self) -> bool {
        matches!(self, Self::Ack(_) | Self::EngineError { .. })
    }

    /// Returns the wire kind of this reply.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Hello(_) => "HelloOk",
            Self::StatusInfo(_) => "StatusInfo",
            Self::LayerNames(_) => "LayerNames",
            Self::CurrentLayerName(_) => "CurrentLayerName",
            Self::ReloadResult(_) => "ReloadResult",
            Self::Ack(_) => "status",
            Self::EngineError { .. } => "Error",
            Self::Other { kind, .. } => kind,
        }
    }
}

// ============================================================================
// Line Classification
// ============================================================================

/// Classification of one incoming line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Unsolicited broadcast of the given kind.
    Broadcast(String),
    /// Anything else.
    Reply(Reply),
}

/// Classifies one line from the engine.
///
/// # Errors
///
/// Returns [`Error::InvalidResponse`] if the line is not a JSON object, or if
/// it names a known reply kind but does not match its schema.
pub fn classify_line(line: &str) -> Result<Incoming> {
    let trimmed = line.trim();
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| Error::invalid_response(format!("{e}: {}", echo(trimmed))))?;

    let Some(object) = value.as_object() else {
        return Err(Error::invalid_response(format!(
            "expected JSON object: {}",
            echo(trimmed)
        )));
    };

    if object.contains_key("status") {
        let ack = StatusAck::deserialize(&value)
            .map_err(|e| Error::invalid_response(format!("bad status line: {e}")))?;
        return Ok(Incoming::Reply(Reply::Ack(ack)));
    }

    if let Some(hello) = ServerHello::from_value(&value) {
        return Ok(Incoming::Reply(Reply::Hello(hello)));
    }

    let Some(kind) = single_tag(object) else {
        return Err(Error::invalid_response(format!(
            "expected exactly one top-level key: {}",
            echo(trimmed)
        )));
    };

    if is_broadcast_kind(kind) {
        return Ok(Incoming::Broadcast(kind.to_string()));
    }

    let reply = match kind {
        "HelloOk" => {
            return Err(Error::invalid_response(format!(
                "HelloOk matches neither known shape: {}",
                echo(trimmed)
            )));
        }
        "Error" => {
            let body = object.get(kind).cloned().unwrap_or(Value::Null);
            let error = EngineError::deserialize(body)
                .map_err(|e| Error::invalid_response(format!("bad Error line: {e}")))?;
            Reply::EngineError {
                msg: error.msg,
                request_id: error.request_id,
            }
        }
        "StatusInfo" | "LayerNames" | "CurrentLayerName" | "ReloadResult" => {
            match TaggedReply::deserialize(&value)
                .map_err(|e| Error::invalid_response(format!("bad {kind} line: {e}")))?
            {
                TaggedReply::StatusInfo(info) => Reply::StatusInfo(info),
                TaggedReply::LayerNames(names) => Reply::LayerNames(names),
                TaggedReply::CurrentLayerName(current) => Reply::CurrentLayerName(current),
                TaggedReply::ReloadResult(result) => Reply::ReloadResult(result),
            }
        }
        _ => Reply::Other {
            kind: kind.to_string(),
            request_id: object
                .get(kind)
                .and_then(|body| body.get("request_id"))
                .and_then(Value::as_u64)
                .map(RequestId::new),
        },
    };

    Ok(Incoming::Reply(reply))
}

/// Returns the tag of a single-key object.
fn single_tag(object: &Map<String, Value>) -> Option<&str> {
    let mut keys = object.keys();
    match (keys.next(), keys.next()) {
        (Some(kind), None) => Some(kind.as_str()),
        _ => None,
    }
}

/// Truncates a line for inclusion in an error message.
fn echo(line: &str) -> &str {
    if line.len() <= MAX_ECHOED_BYTES {
        return line;
    }
    let mut end = MAX_ECHOED_BYTES;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(line: &str) -> Reply {
        match classify_line(line).expect("classify") {
            Incoming::Reply(reply) => reply,
            Incoming::Broadcast(kind) => panic!("unexpected broadcast {kind}"),
        }
    }

    #[test]
    fn test_broadcasts_are_recognized() {
        for line in [
            r#"{"LayerChange":{"new":"nav"}}"#,
            r#"{"ConfigFileReload":{"new":"/tmp/kanata.kbd"}}"#,
            r#"{"MessagePush":{"message":["launch:obsidian"]}}"#,
            r#"{"Ready":{}}"#,
            r#"{"ConfigError":{"msg":"line 3"}}"#,
        ] {
            assert!(
                matches!(classify_line(line), Ok(Incoming::Broadcast(_))),
                "{line}"
            );
        }
    }

    #[test]
    fn test_rich_hello() {
        let line = r#"{"HelloOk":{"version":"1.10.0","protocol":1,"capabilities":["reload","status"],"request_id":1}}"#;
        let Reply::Hello(hello) = reply(line) else {
            panic!("expected hello");
        };
        assert_eq!(hello.shape, HelloShape::Rich);
        assert_eq!(hello.server_version, "1.10.0");
        assert_eq!(hello.request_id, Some(RequestId::new(1)));
        assert!(hello.supports("reload"));
        assert!(hello.require(&["reload", "status"]).is_ok());
    }

    #[test]
    fn test_minimal_hello_untagged() {
        let line = r#"{"server":"kanata","capabilities":["hold_activated"]}"#;
        let Reply::Hello(hello) = reply(line) else {
            panic!("expected hello");
        };
        assert_eq!(hello.shape, HelloShape::Minimal);
        assert_eq!(hello.server_version, "kanata");
        assert_eq!(hello.protocol, MINIMAL_HELLO_PROTOCOL);
        assert!(hello.require(&["hold_activated"]).is_ok());
    }

    #[test]
    fn test_minimal_hello_tagged() {
        let line = r#"{"HelloOk":{"server":"kanata","capabilities":[]}}"#;
        let Reply::Hello(hello) = reply(line) else {
            panic!("expected hello");
        };
        assert_eq!(hello.shape, HelloShape::Minimal);
    }

    #[test]
    fn test_require_reports_missing() {
        let line = r#"{"HelloOk":{"version":"1.9.0","protocol":1,"capabilities":["status"]}}"#;
        let Reply::Hello(hello) = reply(line) else {
            panic!("expected hello");
        };
        match hello.require(&["status", "reload", "tap_activated"]) {
            Err(Error::CapabilityUnsupported { missing, protocol }) => {
                assert_eq!(missing, vec!["reload", "tap_activated"]);
                assert_eq!(protocol, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_require_rejects_protocol_zero() {
        let line = r#"{"HelloOk":{"version":"0.1","protocol":0,"capabilities":["status"]}}"#;
        let Reply::Hello(hello) = reply(line) else {
            panic!("expected hello");
        };
        assert!(hello.require(&["status"]).is_err());
    }

    #[test]
    fn test_malformed_hello_is_invalid() {
        let result = classify_line(r#"{"HelloOk":{"capabilities":"nope"}}"#);
        assert!(matches!(result, Err(Error::InvalidResponse { .. })));
    }

    #[test]
    fn test_status_ack_with_and_without_id() {
        let Reply::Ack(ack) = reply(r#"{"status":"Ok","request_id":4}"#) else {
            panic!("expected ack");
        };
        assert!(ack.is_ok());
        assert_eq!(ack.request_id, Some(RequestId::new(4)));

        let Reply::Ack(ack) = reply(r#"{"status":"Error","msg":"bad config"}"#) else {
            panic!("expected ack");
        };
        assert!(!ack.is_ok());
        assert_eq!(ack.error_message(), "bad config");
        assert!(Reply::Ack(ack).is_direct_answer());
    }

    #[test]
    fn test_status_info() {
        let line = r#"{"StatusInfo":{"engine_version":"1.10.0","uptime_s":42,"ready":true,"last_reload":{"ok":true,"at":"1700000000"},"request_id":2}}"#;
        let Reply::StatusInfo(info) = reply(line) else {
            panic!("expected status");
        };
        assert!(info.ready);
        assert_eq!(info.uptime_s, 42);
        assert_eq!(info.last_reload.map(|r| r.ok), Some(true));
    }

    #[test]
    fn test_known_kind_with_wrong_schema_is_invalid() {
        let result = classify_line(r#"{"LayerNames":{"names":"base"}}"#);
        assert!(matches!(result, Err(Error::InvalidResponse { .. })));
    }

    #[test]
    fn test_engine_error_line() {
        let reply = reply(r#"{"Error":{"msg":"unknown layer"}}"#);
        assert!(reply.is_direct_answer());
        assert!(matches!(reply, Reply::EngineError { ref msg, .. } if msg == "unknown layer"));
    }

    #[test]
    fn test_unknown_kind_keeps_request_id() {
        let reply = reply(r#"{"CurrentLayerInfo":{"name":"base","cfg_text":"","request_id":9}}"#);
        assert_eq!(reply.kind(), "CurrentLayerInfo");
        assert_eq!(reply.request_id(), Some(RequestId::new(9)));
    }

    #[test]
    fn test_garbage_is_invalid() {
        assert!(matches!(
            classify_line("not json"),
            Err(Error::InvalidResponse { .. })
        ));
        assert!(matches!(
            classify_line("[1,2,3]"),
            Err(Error::InvalidResponse { .. })
        ));
        assert!(matches!(
            classify_line(r#"{"A":{},"B":{}}"#),
            Err(Error::InvalidResponse { .. })
        ));
    }
}
