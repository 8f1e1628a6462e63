//! Request/response client.
//!
//! Performs one logical request at a time over a lazily opened connection and
//! returns the line that answers it, hiding connection setup, a single retry
//! and unsolicited broadcasts from the caller.
//!
//! # Exchange
//!
//! 1. Connect if needed (concurrent callers queue behind the session lock)
//! 2. Tag the request with a fresh `request_id`
//! 3. Write it, then read lines until one correlates:
//!    - broadcast kinds are skipped
//!    - a different `request_id` is skipped (a timed-out caller's answer)
//!    - a missing `request_id` is skipped unless the reply is a direct answer
//! 4. On timeout or connection failure, drop the connection, wait briefly and
//!    try exactly once more
//!
//! The protocol has no multiplexing, so requests are never pipelined.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::identifiers::{RequestId, RequestIdGenerator};
use crate::protocol::{
    ClientMessage, FakeKeyAction, Incoming, ReloadResult, Reply, ServerHello, StatusAck,
    StatusInfo, classify_line,
};

use super::stream::LineStream;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle of the client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Connect in progress.
    Connecting,
    /// Connected and usable.
    Ready,
    /// Last connect or exchange failed; the next call reconnects.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Failed => "failed",
        })
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Everything the engine said about a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadResponse {
    /// Status line, if the engine sent one.
    pub ack: Option<StatusAck>,
    /// Structured result, if the engine sent one.
    pub result: Option<ReloadResult>,
    /// Success was inferred from a bare `Ok` status (older engines).
    pub legacy: bool,
}

/// Result of a reload request.
///
/// Reload failure is an expected outcome, so it is a value rather than an
/// error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Engine is running the new configuration.
    Success {
        /// Engine response.
        response: ReloadResponse,
    },
    /// Engine rejected or did not finish the reload.
    Failure {
        /// Human-readable reason.
        reason: String,
        /// Engine response, if any was decoded.
        response: Option<ReloadResponse>,
    },
    /// Engine unreachable.
    NetworkError {
        /// Transport error description.
        message: String,
    },
}

impl ReloadOutcome {
    /// Returns `true` on success.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Result of a virtual key action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeKeyOutcome {
    /// Engine applied the action.
    Success,
    /// Engine refused the action.
    Error {
        /// Engine-provided reason.
        message: String,
    },
    /// Engine unreachable.
    NetworkError {
        /// Transport error description.
        message: String,
    },
}

// ============================================================================
// Call
// ============================================================================

/// A request kind, before a `request_id` is assigned.
#[derive(Debug, Clone)]
enum Call {
    Hello,
    Status,
    LayerNames,
    CurrentLayerName,
    Reload { wait: bool, timeout_ms: u64 },
    FakeKey { name: String, action: FakeKeyAction },
    ChangeLayer { name: String },
}

impl Call {
    fn message(&self, request_id: RequestId) -> ClientMessage {
        match self {
            Self::Hello => ClientMessage::Hello { request_id },
            Self::Status => ClientMessage::Status { request_id },
            Self::LayerNames => ClientMessage::RequestLayerNames { request_id },
            Self::CurrentLayerName => ClientMessage::RequestCurrentLayerName { request_id },
            Self::Reload { wait, timeout_ms } => ClientMessage::Reload {
                wait: *wait,
                timeout_ms: *timeout_ms,
                request_id,
            },
            Self::FakeKey { name, action } => ClientMessage::ActOnFakeKey {
                name: name.clone(),
                action: *action,
                request_id,
            },
            Self::ChangeLayer { name } => ClientMessage::ChangeLayer {
                new: name.clone(),
                request_id,
            },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Status => "status",
            Self::LayerNames => "layer names",
            Self::CurrentLayerName => "current layer name",
            Self::Reload { .. } => "reload",
            Self::FakeKey { .. } => "fake key",
            Self::ChangeLayer { .. } => "change layer",
        }
    }

    /// Whether `reply` is the kind this call is waiting for.
    fn expects(&self, reply: &Reply) -> bool {
        match self {
            Self::Hello => matches!(reply, Reply::Hello(_)),
            Self::Status => matches!(reply, Reply::StatusInfo(_)),
            Self::LayerNames => matches!(reply, Reply::LayerNames(_)),
            Self::CurrentLayerName => matches!(reply, Reply::CurrentLayerName(_)),
            Self::Reload { .. } => matches!(reply, Reply::Ack(_) | Reply::ReloadResult(_)),
            Self::FakeKey { .. } | Self::ChangeLayer { .. } => matches!(reply, Reply::Ack(_)),
        }
    }
}

/// Replies collected for one call.
#[derive(Debug)]
struct Answer {
    first: Reply,
    reload_result: Option<ReloadResult>,
}

// ============================================================================
// Session
// ============================================================================

/// Connection plus everything cached for its lifetime.
#[derive(Debug, Default)]
struct Session {
    stream: Option<LineStream>,
    hello: Option<ServerHello>,
    /// An exchange started and never finished (its future was dropped).
    interrupted: bool,
}

// ============================================================================
// TransportClient
// ============================================================================

/// Request/response client for the engine control socket.
///
/// One instance owns one connection. Public methods are the only way to
/// touch it, and they serialize internally.
///
/// # Example
///
/// ```ignore
/// use kanata_link::{ClientConfig, TransportClient};
///
/// let client = TransportClient::new(ClientConfig::new(37001))?;
/// client.require_capabilities(&["reload"]).await?;
/// let outcome = client.reload(true, 5000).await;
/// ```
pub struct TransportClient {
    config: ClientConfig,
    ids: RequestIdGenerator,
    session: Mutex<Session>,
    state: watch::Sender<ConnectionState>,
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("addr", &self.config.addr())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TransportClient - Constructor
// ============================================================================

impl TransportClient {
    /// Creates a client. No connection is made until the first call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            config,
            ids: RequestIdGenerator::new(),
            session: Mutex::new(Session::default()),
            state,
        })
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to connection state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

// ============================================================================
// TransportClient - Public API
// ============================================================================

impl TransportClient {
    /// Performs the capability handshake.
    ///
    /// The result is cached until the connection is discarded or closed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidResponse`] if the engine answers with something other
    ///   than a hello
    /// - connection, timeout and protocol errors from the exchange
    pub async fn hello(&self) -> Result<ServerHello> {
        if let Some(hello) = self.session.lock().await.hello.clone() {
            trace!("Using cached handshake");
            return Ok(hello);
        }

        match self.exchange(Call::Hello).await?.first {
            Reply::Hello(hello) => {
                info!(
                    version = %hello.server_version,
                    protocol = hello.protocol,
                    capabilities = hello.capabilities.len(),
                    "Handshake completed"
                );
                Ok(hello)
            }
            other => Err(unexpected(&Call::Hello, &other)),
        }
    }

    /// Handshakes and checks that every required capability is advertised.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapabilityUnsupported`] if anything is missing.
    pub async fn require_capabilities(&self, required: &[&str]) -> Result<ServerHello> {
        let hello = self.hello().await?;
        hello.require(required)?;
        Ok(hello)
    }

    /// Returns the cached capability set without contacting the engine.
    pub async fn cached_hello(&self) -> Option<ServerHello> {
        self.session.lock().await.hello.clone()
    }

    /// Queries engine readiness, uptime and last reload outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Engine`] if the engine answers with an error status.
    pub async fn status(&self) -> Result<StatusInfo> {
        match self.exchange(Call::Status).await?.first {
            Reply::StatusInfo(info) => Ok(info),
            other => Err(unexpected(&Call::Status, &other)),
        }
    }

    /// Lists configured layer names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Engine`] if the engine answers with an error status.
    pub async fn layer_names(&self) -> Result<Vec<String>> {
        match self.exchange(Call::LayerNames).await?.first {
            Reply::LayerNames(names) => Ok(names.names),
            other => Err(unexpected(&Call::LayerNames, &other)),
        }
    }

    /// Returns the active layer name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Engine`] if the engine answers with an error status.
    pub async fn current_layer_name(&self) -> Result<String> {
        match self.exchange(Call::CurrentLayerName).await?.first {
            Reply::CurrentLayerName(current) => Ok(current.name),
            other => Err(unexpected(&Call::CurrentLayerName, &other)),
        }
    }

    /// Switches the active layer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Engine`] if the engine refuses the switch.
    pub async fn change_layer(&self, name: &str) -> Result<()> {
        let call = Call::ChangeLayer {
            name: name.to_string(),
        };
        match self.exchange(call.clone()).await?.first {
            Reply::Ack(ack) if ack.is_ok() => {
                debug!(layer = name, "Layer changed");
                Ok(())
            }
            other => Err(unexpected(&call, &other)),
        }
    }

    /// Applies an action to a virtual key.
    pub async fn act_on_fake_key(&self, name: &str, action: FakeKeyAction) -> FakeKeyOutcome {
        let call = Call::FakeKey {
            name: name.to_string(),
            action,
        };

        match self.exchange(call).await {
            Ok(Answer {
                first: Reply::Ack(ack),
                ..
            }) if ack.is_ok() => FakeKeyOutcome::Success,
            Ok(Answer {
                first: Reply::Ack(ack),
                ..
            }) => FakeKeyOutcome::Error {
                message: ack.error_message(),
            },
            Ok(Answer {
                first: Reply::EngineError { msg, .. },
                ..
            }) => FakeKeyOutcome::Error { message: msg },
            Ok(Answer { first, .. }) => FakeKeyOutcome::Error {
                message: format!("unexpected {} reply", first.kind()),
            },
            Err(e) if e.is_recoverable() => FakeKeyOutcome::NetworkError {
                message: e.to_string(),
            },
            Err(e) => FakeKeyOutcome::Error {
                message: e.to_string(),
            },
        }
    }

    /// Asks the engine to reload its configuration.
    ///
    /// With `wait`, the engine answers once it is ready on the new
    /// configuration or `timeout_ms` has elapsed.
    pub async fn reload(&self, wait: bool, timeout_ms: u64) -> ReloadOutcome {
        let call = Call::Reload { wait, timeout_ms };
        let budget = self
            .config
            .request_timeout
            .saturating_add(self.reload_result_window(wait, timeout_ms));

        match self.exchange_with_budget(call, budget).await {
            Ok(answer) => reload_outcome(answer),
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Reload request failed at transport level");
                ReloadOutcome::NetworkError {
                    message: e.to_string(),
                }
            }
            Err(e) => ReloadOutcome::Failure {
                reason: e.to_string(),
                response: None,
            },
        }
    }

    /// Closes the connection and forgets the cached handshake.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        session.hello = None;
        session.interrupted = false;
        if let Some(stream) = session.stream.take() {
            stream.shutdown().await;
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

// ============================================================================
// TransportClient - Exchange
// ============================================================================

impl TransportClient {
    async fn exchange(&self, call: Call) -> Result<Answer> {
        self.exchange_with_budget(call, self.config.request_timeout)
            .await
    }

    /// Runs one call with the overall budget and a single retry.
    async fn exchange_with_budget(&self, call: Call, budget: Duration) -> Result<Answer> {
        let mut session = self.session.lock().await;

        let error = match self.attempt(&mut session, &call, budget).await {
            Ok(answer) => return Ok(answer),
            Err(e) => e,
        };

        if !error.is_recoverable() {
            if error.should_discard_connection() {
                self.discard(&mut session, &error);
            }
            return Err(error);
        }

        warn!(call = call.name(), error = %error, "Exchange failed, retrying once");
        self.discard(&mut session, &error);
        sleep(self.config.retry_backoff).await;

        self.attempt(&mut session, &call, budget)
            .await
            .inspect_err(|e| {
                if e.should_discard_connection() {
                    self.discard(&mut session, e);
                }
            })
    }

    /// One timed attempt.
    async fn attempt(&self, session: &mut Session, call: &Call, budget: Duration) -> Result<Answer> {
        let deadline = deadline_after(budget);
        match timeout_at(deadline, self.perform(session, call, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(call.name(), budget)),
        }
    }

    async fn perform(
        &self,
        session: &mut Session,
        call: &Call,
        deadline: Instant,
    ) -> Result<Answer> {
        if session.interrupted {
            debug!("Previous exchange was interrupted, reconnecting");
            self.discard(session, &Error::ConnectionClosed);
        }

        let request_id = self.ids.next_id();
        let message = call.message(request_id);

        session.interrupted = true;
        let stream = self.ensure_connected(session).await?;
        stream.send(&message).await?;

        let first = self.await_reply(stream, call, request_id).await?;
        let reload_result = match (call, &first) {
            (Call::Reload { wait, timeout_ms }, Reply::Ack(ack)) if ack.is_ok() => {
                let window = self.reload_result_window(*wait, *timeout_ms);
                let until = deadline_after(window).min(deadline);
                self.await_reload_result(stream, request_id, until).await?
            }
            _ => None,
        };
        session.interrupted = false;

        if let Reply::Hello(hello) = &first {
            session.hello = Some(hello.clone());
        }

        Ok(Answer {
            first,
            reload_result,
        })
    }

    async fn ensure_connected<'s>(&self, session: &'s mut Session) -> Result<&'s mut LineStream> {
        if session.stream.is_none() {
            self.state.send_replace(ConnectionState::Connecting);
            match LineStream::connect(
                self.config.addr(),
                self.config.connect_timeout,
                self.config.max_line_bytes,
            )
            .await
            {
                Ok(stream) => {
                    session.stream = Some(stream);
                    self.state.send_replace(ConnectionState::Ready);
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Failed);
                    return Err(e);
                }
            }
        }

        session.stream.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Reads until a line correlates with `request_id`.
    async fn await_reply(
        &self,
        stream: &mut LineStream,
        call: &Call,
        request_id: RequestId,
    ) -> Result<Reply> {
        let mut skipped = 0usize;

        loop {
            let line = stream.read_line().await?;
            let reason = match classify_line(&line)? {
                Incoming::Broadcast(kind) => {
                    trace!(%kind, "Skipping broadcast");
                    "broadcast"
                }
                Incoming::Reply(reply) => match self.correlate(call, request_id, &reply) {
                    Ok(()) => return Ok(reply),
                    Err(reason) => {
                        debug!(
                            kind = reply.kind(),
                            got = ?reply.request_id(),
                            %request_id,
                            reason,
                            "Skipping reply"
                        );
                        reason
                    }
                },
            };

            skipped += 1;
            if skipped > self.config.max_skipped_lines {
                return Err(Error::protocol(format!(
                    "skipped {skipped} lines waiting for {} #{request_id} (last: {reason})",
                    call.name()
                )));
            }
        }
    }

    /// Decides whether `reply` answers the request tagged `sent`.
    fn correlate(
        &self,
        call: &Call,
        sent: RequestId,
        reply: &Reply,
    ) -> std::result::Result<(), &'static str> {
        match reply.request_id() {
            Some(id) if id == sent => Ok(()),
            Some(_) => Err("stale request_id"),
            None if is_failure(reply) => Ok(()),
            None if !call.expects(reply) => Err("unexpected kind without request_id"),
            None if reply.is_direct_answer() => Ok(()),
            None if matches!(call, Call::Hello) => Ok(()),
            None if !self.config.strict_correlation => Ok(()),
            None => Err("missing request_id"),
        }
    }

    /// How long a follow-up `ReloadResult` may trail the status line.
    ///
    /// A waiting reload may report readiness as late as `timeout_ms` after
    /// the ack.
    fn reload_result_window(&self, wait: bool, timeout_ms: u64) -> Duration {
        let grace = self.config.reload_result_grace;
        if wait {
            Duration::from_millis(timeout_ms).saturating_add(grace)
        } else {
            grace
        }
    }

    /// Reads the follow-up `ReloadResult` line until `deadline`.
    async fn await_reload_result(
        &self,
        stream: &mut LineStream,
        request_id: RequestId,
        deadline: Instant,
    ) -> Result<Option<ReloadResult>> {
        let mut skipped = 0usize;

        loop {
            let line = match timeout_at(deadline, stream.read_line()).await {
                Ok(line) => line?,
                Err(_) => return Ok(None),
            };

            match classify_line(&line)? {
                Incoming::Reply(Reply::ReloadResult(result))
                    if result.request_id.is_none_or(|id| id == request_id) =>
                {
                    return Ok(Some(result));
                }
                other => trace!(?other, "Skipping line while waiting for reload result"),
            }

            skipped += 1;
            if skipped > self.config.max_skipped_lines {
                return Err(Error::protocol(format!(
                    "skipped {skipped} lines waiting for reload result #{request_id}"
                )));
            }
        }
    }

    /// Drops the connection so the next call starts clean.
    fn discard(&self, session: &mut Session, reason: &Error) {
        session.hello = None;
        session.interrupted = false;
        if let Some(stream) = session.stream.take() {
            warn!(peer = %stream.peer(), error = %reason, "Discarding connection");
            self.state.send_replace(ConnectionState::Failed);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// `Instant` `budget` from now, clamped to the far future.
fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365))
}

/// Ack with an error status, or an engine `Error` line.
fn is_failure(reply: &Reply) -> bool {
    match reply {
        Reply::Ack(ack) => !ack.is_ok(),
        Reply::EngineError { .. } => true,
        _ => false,
    }
}

/// Converts a correlated reply of the wrong kind into an error.
fn unexpected(call: &Call, reply: &Reply) -> Error {
    match reply {
        Reply::Ack(ack) if !ack.is_ok() => Error::engine(ack.error_message()),
        Reply::EngineError { msg, .. } => Error::engine(msg.clone()),
        other => Error::invalid_response(format!(
            "{} answered with {}",
            call.name(),
            other.kind()
        )),
    }
}

fn reload_outcome(answer: Answer) -> ReloadOutcome {
    match answer.first {
        Reply::Ack(ack) if !ack.is_ok() => ReloadOutcome::Failure {
            reason: ack.error_message(),
            response: Some(ReloadResponse {
                ack: Some(ack),
                result: None,
                legacy: false,
            }),
        },
        Reply::EngineError { msg, .. } => ReloadOutcome::Failure {
            reason: msg,
            response: None,
        },
        Reply::ReloadResult(result) => evaluate_reload(None, result),
        Reply::Ack(ack) => match answer.reload_result {
            Some(result) => evaluate_reload(Some(ack), result),
            None => {
                // Legacy compatibility: older engines answer a reload with a
                // bare status line and no structured result.
                debug!("Reload acknowledged without ReloadResult, treating as success");
                ReloadOutcome::Success {
                    response: ReloadResponse {
                        ack: Some(ack),
                        result: None,
                        legacy: true,
                    },
                }
            }
        },
        other => ReloadOutcome::Failure {
            reason: format!("unexpected {} reply to reload", other.kind()),
            response: None,
        },
    }
}

fn evaluate_reload(ack: Option<StatusAck>, result: ReloadResult) -> ReloadOutcome {
    let ready = result.ready;
    let timeout_ms = result.timeout_ms;
    let response = ReloadResponse {
        ack,
        result: Some(result),
        legacy: false,
    };

    if ready {
        ReloadOutcome::Success { response }
    } else {
        ReloadOutcome::Failure {
            reason: match timeout_ms {
                Some(ms) => format!("engine not ready within {ms}ms after reload"),
                None => "engine not ready after reload".to_string(),
            },
            response: Some(response),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::Error;
    use crate::test_support::{closed_port, init_tracing, request_id, spawn_engine};

    use tokio_test::{assert_err, assert_ok};

    fn client_for(port: u16) -> TransportClient {
        TransportClient::new(
            ClientConfig::new(port)
                .with_request_timeout(Duration::from_millis(500))
                .with_retry_backoff(Duration::from_millis(10))
                .with_reload_result_grace(Duration::from_millis(200)),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn test_skips_broadcast_and_stale_reply() {
        let engine = spawn_engine(|mut conn, _| async move {
            while let Some((kind, body)) = conn.recv().await {
                assert_eq!(kind, "RequestLayerNames");
                let id = request_id(&body);
                conn.send_line(r#"{"LayerChange":{"new":"nav"}}"#).await;
                conn.send_line(&format!(
                    r#"{{"LayerNames":{{"names":["stale"],"request_id":{}}}}}"#,
                    id + 100
                ))
                .await;
                conn.send_line(&format!(
                    r#"{{"LayerNames":{{"names":["base","nav"],"request_id":{id}}}}}"#
                ))
                .await;
            }
        })
        .await;

        let client = client_for(engine.port());
        let names = client.layer_names().await.expect("layer names");
        assert_eq!(names, vec!["base", "nav"]);
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_uncorrelated_reply_skipped_when_strict() {
        let engine = spawn_engine(|mut conn, _| async move {
            while let Some((_, body)) = conn.recv().await {
                let id = request_id(&body);
                let answer = format!(r#"{{"CurrentLayerName":{{"name":"base","request_id":{id}}}}}"#);
                conn.send_line(r#"{"CurrentLayerName":{"name":"broadcasted"}}"#).await;
                conn.send_line(&answer).await;
            }
        })
        .await;

        let client = client_for(engine.port());
        assert_eq!(client.current_layer_name().await.expect("name"), "base");
    }

    #[tokio::test]
    async fn test_uncorrelated_reply_accepted_when_lenient() {
        let engine = spawn_engine(|mut conn, _| async move {
            while conn.recv().await.is_some() {
                conn.send_line(r#"{"CurrentLayerName":{"name":"legacy"}}"#).await;
            }
        })
        .await;

        let client = TransportClient::new(
            ClientConfig::new(engine.port()).with_strict_correlation(false),
        )
        .expect("client");
        assert_eq!(client.current_layer_name().await.expect("name"), "legacy");
    }

    #[tokio::test]
    async fn test_too_many_skipped_lines() {
        let engine = spawn_engine(|mut conn, _| async move {
            while conn.recv().await.is_some() {
                conn.send_raw(&"{\"LayerChange\":{\"new\":\"nav\"}}\n".repeat(60)).await;
            }
        })
        .await;

        let client = client_for(engine.port());
        let err = client.status().await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_minimal_hello_after_broadcast_is_cached() {
        let hellos = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hellos);
        let engine = spawn_engine(move |mut conn, _| {
            let seen = Arc::clone(&seen);
            async move {
                while let Some((kind, _)) = conn.recv().await {
                    assert_eq!(kind, "Hello");
                    seen.fetch_add(1, Ordering::SeqCst);
                    conn.send_line(r#"{"Ready":{}}"#).await;
                    conn.send_line(r#"{"server":"kanata","capabilities":["hold_activated"]}"#)
                        .await;
                }
            }
        })
        .await;

        let client = client_for(engine.port());
        let hello = client
            .require_capabilities(&["hold_activated"])
            .await
            .expect("capabilities");
        assert_eq!(hello.server_version, "kanata");

        client.hello().await.expect("cached");
        assert_eq!(hellos.load(Ordering::SeqCst), 1);
        assert!(client.cached_hello().await.is_some());

        client.close().await;
        assert!(client.cached_hello().await.is_none());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_capability() {
        let engine = spawn_engine(|mut conn, _| async move {
            while let Some((_, body)) = conn.recv().await {
                conn.send_line(&format!(
                    r#"{{"HelloOk":{{"version":"1.10.0","protocol":1,"capabilities":["status"],"request_id":{}}}}}"#,
                    request_id(&body)
                ))
                .await;
            }
        })
        .await;

        let client = client_for(engine.port());
        let err = client.require_capabilities(&["reload"]).await.unwrap_err();
        assert!(matches!(err, Error::CapabilityUnsupported { .. }));
    }

    #[tokio::test]
    async fn test_reload_status_and_result_in_one_packet() {
        let engine = spawn_engine(|mut conn, _| async move {
            while let Some((kind, body)) = conn.recv().await {
                assert_eq!(kind, "Reload");
                assert_eq!(body["wait"], true);
                let id = request_id(&body);
                conn.send_raw(&format!(
                    "{{\"status\":\"Ok\"}}\n{{\"ReloadResult\":{{\"ready\":true,\"timeout_ms\":2000,\"ok\":true,\"duration_ms\":40,\"epoch\":3,\"request_id\":{id}}}}}\n"
                ))
                .await;
            }
        })
        .await;

        let client = client_for(engine.port());
        match client.reload(true, 2000).await {
            ReloadOutcome::Success { response } => {
                assert!(!response.legacy);
                assert_eq!(response.result.and_then(|r| r.epoch), Some(3));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reload_error_status_does_not_wait() {
        let engine = spawn_engine(|mut conn, _| async move {
            while conn.recv().await.is_some() {
                conn.send_line(r#"{"status":"Error","msg":"bad config"}"#).await;
            }
        })
        .await;

        let client = TransportClient::new(
            ClientConfig::new(engine.port()).with_reload_result_grace(Duration::from_secs(5)),
        )
        .expect("client");

        let started = std::time::Instant::now();
        match client.reload(true, 1000).await {
            ReloadOutcome::Failure { reason, .. } => assert_eq!(reason, "bad config"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_reload_not_ready_is_failure() {
        let engine = spawn_engine(|mut conn, _| async move {
            while let Some((_, body)) = conn.recv().await {
                conn.send_line(&format!(
                    r#"{{"ReloadResult":{{"ready":false,"timeout_ms":1500,"request_id":{}}}}}"#,
                    request_id(&body)
                ))
                .await;
            }
        })
        .await;

        let client = client_for(engine.port());
        match client.reload(true, 1500).await {
            ReloadOutcome::Failure { reason, response } => {
                assert!(reason.contains("1500ms"));
                assert!(response.is_some());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reload_late_not_ready_result_is_failure() {
        let engine = spawn_engine(|mut conn, _| async move {
            while let Some((_, body)) = conn.recv().await {
                let id = request_id(&body);
                conn.send_line(r#"{"status":"Ok"}"#).await;
                // Readiness is reported well past the result grace.
                tokio::time::sleep(Duration::from_millis(1500)).await;
                conn.send_line(&format!(
                    r#"{{"ReloadResult":{{"ready":false,"timeout_ms":5000,"request_id":{id}}}}}"#
                ))
                .await;
            }
        })
        .await;

        let client = client_for(engine.port());
        match client.reload(true, 5000).await {
            ReloadOutcome::Failure { reason, response } => {
                assert!(reason.contains("5000ms"), "{reason}");
                assert!(response.is_some_and(|r| !r.legacy));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reload_without_wait_keeps_short_window() {
        let engine = spawn_engine(|mut conn, _| async move {
            while conn.recv().await.is_some() {
                conn.send_line(r#"{"status":"Ok"}"#).await;
            }
        })
        .await;

        let client = client_for(engine.port());
        let started = std::time::Instant::now();
        match client.reload(false, 5000).await {
            ReloadOutcome::Success { response } => assert!(response.legacy),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_reload_bare_ok_is_legacy_success() {
        let engine = spawn_engine(|mut conn, _| async move {
            while conn.recv().await.is_some() {
                conn.send_line(r#"{"status":"Ok"}"#).await;
            }
        })
        .await;

        let client = client_for(engine.port());
        match client.reload(false, 0).await {
            ReloadOutcome::Success { response } => assert!(response.legacy),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_once_on_dropped_connection() {
        init_tracing();
        let engine = spawn_engine(|mut conn, index| async move {
            while let Some((_, body)) = conn.recv().await {
                if index == 0 {
                    // First connection dies without answering.
                    return;
                }
                conn.send_line(&format!(
                    r#"{{"StatusInfo":{{"engine_version":"1.10.0","uptime_s":3,"ready":true,"request_id":{}}}}}"#,
                    request_id(&body)
                ))
                .await;
            }
        })
        .await;

        let client = client_for(engine.port());
        let info = client.status().await.expect("status after retry");
        assert!(info.ready);
        assert_eq!(engine.connections(), 2);
    }

    #[tokio::test]
    async fn test_timeout_after_single_retry() {
        init_tracing();
        let engine = spawn_engine(|mut conn, _| async move {
            while conn.recv().await.is_some() {}
        })
        .await;

        let client = TransportClient::new(
            ClientConfig::new(engine.port())
                .with_request_timeout(Duration::from_millis(100))
                .with_retry_backoff(Duration::from_millis(10)),
        )
        .expect("client");

        let err = client.status().await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert_eq!(engine.connections(), 2);
        assert_eq!(client.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_engine_error_keeps_connection() {
        let engine = spawn_engine(|mut conn, _| async move {
            while let Some((kind, body)) = conn.recv().await {
                match kind.as_str() {
                    "ChangeLayer" => conn.send_line(r#"{"status":"Error","msg":"no such layer"}"#).await,
                    _ => {
                        conn.send_line(&format!(
                            r#"{{"status":"Ok","request_id":{}}}"#,
                            request_id(&body)
                        ))
                        .await
                    }
                }
            }
        })
        .await;

        let client = client_for(engine.port());
        let err = client.change_layer("missing").await.unwrap_err();
        assert!(matches!(err, Error::Engine { ref message } if message == "no such layer"));

        let outcome = client.act_on_fake_key("nav", FakeKeyAction::Tap).await;
        assert_eq!(outcome, FakeKeyOutcome::Success);
        assert_eq!(engine.connections(), 1);
    }

    #[tokio::test]
    async fn test_fake_key_error_and_network_error() {
        let engine = spawn_engine(|mut conn, _| async move {
            while conn.recv().await.is_some() {
                conn.send_line(r#"{"status":"Error","msg":"unknown fake key"}"#).await;
            }
        })
        .await;

        let client = client_for(engine.port());
        assert_eq!(
            client.act_on_fake_key("nope", FakeKeyAction::Press).await,
            FakeKeyOutcome::Error {
                message: "unknown fake key".into()
            }
        );

        let offline = client_for(closed_port().await);
        assert!(matches!(
            offline.act_on_fake_key("nav", FakeKeyAction::Release).await,
            FakeKeyOutcome::NetworkError { .. }
        ));
        assert!(matches!(
            offline.reload(true, 100).await,
            ReloadOutcome::NetworkError { .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_connection() {
        let engine = spawn_engine(|mut conn, _| async move {
            while let Some((_, body)) = conn.recv().await {
                tokio::time::sleep(Duration::from_millis(30)).await;
                conn.send_line(&format!(
                    r#"{{"LayerNames":{{"names":["base"],"request_id":{}}}}}"#,
                    request_id(&body)
                ))
                .await;
            }
        })
        .await;

        let client = Arc::new(client_for(engine.port()));
        let calls: Vec<_> = (0..4)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.layer_names().await })
            })
            .collect();

        for call in calls {
            assert_eq!(call.await.expect("join").expect("names"), vec!["base"]);
        }
        assert_eq!(engine.connections(), 1);
    }

    #[tokio::test]
    async fn test_state_transitions_are_observable() {
        let engine = spawn_engine(|mut conn, _| async move {
            while let Some((_, body)) = conn.recv().await {
                conn.send_line(&format!(
                    r#"{{"status":"Ok","request_id":{}}}"#,
                    request_id(&body)
                ))
                .await;
            }
        })
        .await;

        let client = client_for(engine.port());
        let mut states = client.subscribe_state();
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

        assert_ok!(client.change_layer("nav").await);
        assert!(states.has_changed().expect("sender alive"));
        assert_eq!(*states.borrow_and_update(), ConnectionState::Ready);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert_err!(TransportClient::new(ClientConfig::new(0)));
    }
}
