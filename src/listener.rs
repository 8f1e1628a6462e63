//! Persistent event stream.
//!
//! Keeps a self-healing connection to the engine open and delivers typed
//! events to registered callbacks.
//!
//! # State Machine
//!
//! ```text
//! stopped ──start──► connecting ──connected──► streaming
//!                        ▲                         │
//!                        └──── reconnect_delay ◄───┘ (any stream error)
//! ```
//!
//! On entering `streaming` the listener sends a handshake, then a layer
//! query, then keeps re-sending the layer query every `poll_interval`. The
//! engine does not push layer state on its own, so polling stands in for a
//! subscription.
//!
//! # Dispatch
//!
//! | Event | Callback |
//! |-------|----------|
//! | `LayerChange`, `CurrentLayerName` | `on_layer_change` |
//! | `MessagePush` | `on_action`, or `on_unknown_message` if unparseable |
//! | `HelloOk` | none, caches capabilities |
//! | `KeyInput` | `on_key_input` |
//! | `HoldActivated`, `TapActivated` | `on_hold_activated`, `on_tap_activated` (capability gated) |
//! | `ConfigFileReload`, `Ready`, `ConfigError` | matching optional callback |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, info, trace, warn};

use crate::config::ListenerConfig;
use crate::error::{Error, Result};
use crate::identifiers::RequestIdGenerator;
use crate::protocol::{ActionUri, ActivationEvent, ClientMessage, KeyInputEvent, ParsedEvent};
use crate::transport::{LineStream, LineWriter};

// ============================================================================
// Constants
// ============================================================================

/// Capability gating [`ParsedEvent::HoldActivated`] dispatch.
pub const CAP_HOLD_ACTIVATED: &str = "hold_activated";

/// Capability gating [`ParsedEvent::TapActivated`] dispatch.
pub const CAP_TAP_ACTIVATED: &str = "tap_activated";

// ============================================================================
// Types
// ============================================================================

/// Callback receiving one value.
type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Callback receiving nothing.
type Notify = Arc<dyn Fn() + Send + Sync>;

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    /// Not started, or stopped.
    Stopped,
    /// Connecting, or waiting to reconnect.
    Connecting,
    /// Connected and reading events.
    Streaming,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
        })
    }
}

/// Registered callbacks.
#[derive(Default)]
struct Handlers {
    layer: Option<Callback<String>>,
    action: Option<Callback<ActionUri>>,
    unknown: Option<Callback<String>>,
    key_input: Option<Callback<KeyInputEvent>>,
    hold_activated: Option<Callback<ActivationEvent>>,
    tap_activated: Option<Callback<ActivationEvent>>,
    config_reload: Option<Callback<Option<String>>>,
    ready: Option<Notify>,
    config_error: Option<Callback<String>>,
}

/// State shared between the listener handle and its tasks.
struct Shared {
    config: ListenerConfig,
    handlers: Mutex<Handlers>,
    capabilities: Mutex<FxHashSet<String>>,
    state: watch::Sender<ListenerState>,
    /// Bumped by every `start` and `stop`. A loop only publishes while its
    /// generation is current.
    generation: AtomicU64,
}

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A running reconnect loop.
#[derive(Debug)]
struct Running {
    port: u16,
    _task: TaskGuard,
}

// ============================================================================
// EventListener
// ============================================================================

/// Streaming event listener.
///
/// Register callbacks, then call [`EventListener::start`]. Callbacks run on
/// the listener task, in arrival order, and must not block.
///
/// # Example
///
/// ```ignore
/// use kanata_link::{EventListener, ListenerConfig};
///
/// let listener = EventListener::new(ListenerConfig::default())?;
/// listener.on_layer_change(|layer| println!("layer: {layer}"));
/// listener.start(37001)?;
/// ```
pub struct EventListener {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListener")
            .field("port", &self.port())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// EventListener - Lifecycle
// ============================================================================

impl EventListener {
    /// Creates a stopped listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: ListenerConfig) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ListenerState::Stopped);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                handlers: Mutex::new(Handlers::default()),
                capabilities: Mutex::new(FxHashSet::default()),
                state,
                generation: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        })
    }

    /// Starts listening on `port`.
    ///
    /// A no-op if already listening on `port`. Listening on another port is
    /// stopped first; registered callbacks are kept.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for port 0.
    pub fn start(&self, port: u16) -> Result<()> {
        if port == 0 {
            return Err(Error::config("Listener port must be non-zero"));
        }

        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            if current.port == port {
                debug!(port, "Listener already running");
                return Ok(());
            }
            info!(old = current.port, new = port, "Listener moving to new port");
        }

        // Dropping the old guard aborts its loop before the new one starts.
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *running = None;
        self.shared.capabilities.lock().clear();

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(run(shared, port, generation));
        *running = Some(Running {
            port,
            _task: TaskGuard(task),
        });

        info!(port, "Event listener started");
        Ok(())
    }

    /// Stops listening and clears every registered callback.
    ///
    /// The state reads [`ListenerState::Stopped`] on return, even if the
    /// aborted loop is still winding down on another worker.
    pub fn stop(&self) {
        let previous = {
            let mut running = self.running.lock();
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            running.take()
        };
        *self.shared.handlers.lock() = Handlers::default();
        self.shared.capabilities.lock().clear();
        self.shared.state.send_replace(ListenerState::Stopped);

        if let Some(previous) = previous {
            info!(port = previous.port, "Event listener stopped");
        }
    }

    /// Returns `true` while a reconnect loop is running.
    #[inline]
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Returns the port being listened on.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.running.lock().as_ref().map(|running| running.port)
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.shared.state.borrow()
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.shared.state.subscribe()
    }

    /// Capabilities advertised on the current connection.
    ///
    /// Empty until the engine answers the handshake.
    #[must_use]
    pub fn capabilities(&self) -> FxHashSet<String> {
        self.shared.capabilities.lock().clone()
    }
}

// ============================================================================
// EventListener - Callbacks
// ============================================================================

impl EventListener {
    /// Active layer reported, by broadcast or by poll. May repeat.
    pub fn on_layer_change(&self, f: impl Fn(String) + Send + Sync + 'static) {
        self.shared.handlers.lock().layer = Some(Arc::new(f));
    }

    /// Push message carrying an action URI.
    pub fn on_action(&self, f: impl Fn(ActionUri) + Send + Sync + 'static) {
        self.shared.handlers.lock().action = Some(Arc::new(f));
    }

    /// Push message that is not an action URI.
    pub fn on_unknown_message(&self, f: impl Fn(String) + Send + Sync + 'static) {
        self.shared.handlers.lock().unknown = Some(Arc::new(f));
    }

    /// Physical key input.
    pub fn on_key_input(&self, f: impl Fn(KeyInputEvent) + Send + Sync + 'static) {
        self.shared.handlers.lock().key_input = Some(Arc::new(f));
    }

    /// Tap-hold key resolved as hold.
    pub fn on_hold_activated(&self, f: impl Fn(ActivationEvent) + Send + Sync + 'static) {
        self.shared.handlers.lock().hold_activated = Some(Arc::new(f));
    }

    /// Tap-hold key resolved as tap.
    pub fn on_tap_activated(&self, f: impl Fn(ActivationEvent) + Send + Sync + 'static) {
        self.shared.handlers.lock().tap_activated = Some(Arc::new(f));
    }

    /// Engine reloaded its configuration file.
    pub fn on_config_reload(&self, f: impl Fn(Option<String>) + Send + Sync + 'static) {
        self.shared.handlers.lock().config_reload = Some(Arc::new(f));
    }

    /// Engine finished starting.
    pub fn on_ready(&self, f: impl Fn() + Send + Sync + 'static) {
        self.shared.handlers.lock().ready = Some(Arc::new(f));
    }

    /// Engine rejected its configuration.
    pub fn on_config_error(&self, f: impl Fn(String) + Send + Sync + 'static) {
        self.shared.handlers.lock().config_error = Some(Arc::new(f));
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Reconnect loop. Runs until aborted or superseded.
async fn run(shared: Arc<Shared>, port: u16, generation: u64) {
    let addr = SocketAddr::new(shared.config.host, port);

    while shared.publish(generation, ListenerState::Connecting) {
        match stream_events(&shared, addr, generation).await {
            Ok(()) => break,
            Err(e) => warn!(port, error = %e, "Event stream ended, reconnecting"),
        }

        if !shared.publish(generation, ListenerState::Connecting) {
            break;
        }
        shared.capabilities.lock().clear();
        sleep(shared.config.reconnect_delay).await;
    }

    debug!(port, generation, "Listener loop superseded");
}

/// One connection's lifetime. Returns `Ok` once superseded, `Err` when the
/// stream fails.
async fn stream_events(shared: &Shared, addr: SocketAddr, generation: u64) -> Result<()> {
    let stream = LineStream::connect(
        addr,
        shared.config.connect_timeout,
        shared.config.max_line_bytes,
    )
    .await?;
    let (mut reader, mut writer) = stream.into_split();
    let ids = RequestIdGenerator::new();

    writer
        .send(&ClientMessage::Hello {
            request_id: ids.next_id(),
        })
        .await?;
    writer
        .send(&ClientMessage::RequestCurrentLayerName {
            request_id: ids.next_id(),
        })
        .await?;

    if !shared.publish(generation, ListenerState::Streaming) {
        return Ok(());
    }
    shared.capabilities.lock().clear();
    debug!(%addr, "Event stream established");

    let _poller = TaskGuard(tokio::spawn(poll_layer(
        writer,
        ids,
        shared.config.poll_interval,
    )));

    loop {
        let line = reader.read_line().await?;
        if !shared.is_current(generation) {
            return Ok(());
        }
        shared.dispatch(ParsedEvent::from_line(&line));
    }
}

/// Re-sends the layer query until the socket fails or the task is aborted.
async fn poll_layer(
    mut writer: LineWriter,
    ids: RequestIdGenerator,
    every: std::time::Duration,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick is immediate and the initial query was already sent.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let query = ClientMessage::RequestCurrentLayerName {
            request_id: ids.next_id(),
        };
        if let Err(e) = writer.send(&query).await {
            debug!(error = %e, "Layer poll stopped");
            return;
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

impl Shared {
    #[inline]
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Sets `state` if `generation` is still current.
    ///
    /// The check runs under the watch lock, so a concurrent `stop` either
    /// sees this write or overwrites it.
    fn publish(&self, generation: u64, state: ListenerState) -> bool {
        let mut current = true;
        self.state.send_if_modified(|value| {
            current = self.is_current(generation);
            if current && *value != state {
                *value = state;
                return true;
            }
            false
        });
        current
    }

    fn dispatch(&self, event: ParsedEvent) {
        match event {
            ParsedEvent::Layer { name, source } => {
                trace!(layer = %name, ?source, "Layer event");
                let handler = self.handlers.lock().layer.clone();
                if let Some(handler) = handler {
                    handler(name);
                }
            }

            ParsedEvent::MessagePush { messages, raw } => {
                if messages.is_empty() {
                    self.unknown_message(raw.to_string());
                    return;
                }
                for message in messages {
                    match ActionUri::parse(&message) {
                        Some(uri) => {
                            debug!(action = %uri.action, path = ?uri.path, "Action message");
                            let handler = self.handlers.lock().action.clone();
                            if let Some(handler) = handler {
                                handler(uri);
                            }
                        }
                        None => self.unknown_message(message),
                    }
                }
            }

            ParsedEvent::Hello(hello) => {
                debug!(
                    version = %hello.server_version,
                    capabilities = ?hello.capabilities,
                    "Listener handshake"
                );
                *self.capabilities.lock() = hello.capabilities;
            }

            ParsedEvent::KeyInput(event) => {
                let handler = self.handlers.lock().key_input.clone();
                if let Some(handler) = handler {
                    handler(event);
                }
            }

            ParsedEvent::HoldActivated(event) => {
                if !self.allows(CAP_HOLD_ACTIVATED) {
                    trace!(key = %event.key, "HoldActivated not advertised, dropping");
                    return;
                }
                let handler = self.handlers.lock().hold_activated.clone();
                if let Some(handler) = handler {
                    handler(event);
                }
            }

            ParsedEvent::TapActivated(event) => {
                if !self.allows(CAP_TAP_ACTIVATED) {
                    trace!(key = %event.key, "TapActivated not advertised, dropping");
                    return;
                }
                let handler = self.handlers.lock().tap_activated.clone();
                if let Some(handler) = handler {
                    handler(event);
                }
            }

            ParsedEvent::ConfigFileReload { path } => {
                info!(path = ?path, "Engine reloaded its configuration");
                let handler = self.handlers.lock().config_reload.clone();
                if let Some(handler) = handler {
                    handler(path);
                }
            }

            ParsedEvent::Ready => {
                let handler = self.handlers.lock().ready.clone();
                if let Some(handler) = handler {
                    handler();
                }
            }

            ParsedEvent::ConfigError { message } => {
                warn!(error = %message, "Engine reported a configuration error");
                let handler = self.handlers.lock().config_error.clone();
                if let Some(handler) = handler {
                    handler(message);
                }
            }

            ParsedEvent::Unknown { kind, raw } => {
                debug!(kind = ?kind, line = %raw, "Dropping unrecognized event");
            }
        }
    }

    fn unknown_message(&self, message: String) {
        trace!(%message, "Push message is not an action URI");
        let handler = self.handlers.lock().unknown.clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    /// Empty set means the engine predates capability advertisement.
    fn allows(&self, capability: &str) -> bool {
        let capabilities = self.capabilities.lock();
        capabilities.is_empty() || capabilities.contains(capability)
    }
}

// ============================================================================
// Tests
// ============================================================================
