//! Session state machine and pending-request bookkeeping.
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --disconnect--> Closing --> Disconnected
//!                               |                  |
//!                               +--err--> Disconnected
//!                                                  +--transport error--> Failed --> Disconnected
//! ```
//!
//! Every submitted request gets a fresh id from a counter that is never
//! reset, so ids are unique across reconnects. Inbound messages are routed
//! by id to the request's own channel in arrival order; messages nobody is
//! waiting for go to the session event stream. Each pending request is
//! resolved exactly once: by a `done` status, by `cancel`, or by the
//! connection going away.
//!
//! Session events go out on a bounded broadcast channel. A subscriber that
//! falls more than [`EVENT_CAPACITY`] events behind loses the oldest ones and
//! sees `RecvError::Lagged` once; status is always readable from
//! [`Session::status`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::models::{SessionEvent, SessionStatus};
use crate::nrepl::error::{ConnectError, SessionError, TransportError};
use crate::nrepl::message::{Message, Response};
use crate::nrepl::transport::{Inbound, Transport};

/// Receiver for session-wide events.
pub type SessionEvents = broadcast::Receiver<SessionEvent>;

/// Session events buffered per subscriber before the oldest are dropped.
pub const EVENT_CAPACITY: usize = 1024;

/// How a pending request ended without a `done` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Cancelled locally (interrupt or disconnect).
    Cancelled,
    /// The connection failed while the request was pending.
    Failed(SessionError),
}

/// What a request's stream receives.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    /// A reply for this id. The last one carries the `done` status.
    Response(Response),
    /// The request ended without (further) replies.
    Terminated(Termination),
}

/// Where replies for a pending request go.
#[derive(Debug)]
enum Sink {
    Stream(mpsc::UnboundedSender<RequestEvent>),
    /// Fire-and-forget requests (interrupt, close); replies are dropped.
    Discard,
}

impl Sink {
    fn deliver(&self, event: RequestEvent) {
        if let Sink::Stream(tx) = self {
            // Receiver gone means the caller stopped listening
            let _ = tx.send(event);
        }
    }
}

/// Client-side record of a request awaiting replies.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: String,
    pub op: String,
    pub submitted_at: DateTime<Utc>,
    pub cancelled: bool,
    sink: Sink,
}

impl PendingRequest {
    /// Send the terminal event and release the stream.
    fn terminate(&mut self, termination: Termination) {
        if !self.cancelled {
            self.sink.deliver(RequestEvent::Terminated(termination));
        }
        self.sink = Sink::Discard;
    }

    fn elapsed(&self) -> Duration {
        (Utc::now() - self.submitted_at).to_std().unwrap_or_default()
    }
}

/// Stream of replies for one submitted request.
#[derive(Debug)]
pub struct RequestStream {
    id: String,
    rx: mpsc::UnboundedReceiver<RequestEvent>,
}

impl RequestStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event, or `None` once the request is resolved and drained.
    pub async fn recv(&mut self) -> Option<RequestEvent> {
        self.rx.recv().await
    }
}

struct State {
    status: SessionStatus,
    transport: Option<Transport>,
    /// Bumped on every connect/disconnect so stale transport callbacks are ignored.
    generation: u64,
    next_id: u64,
    pending: HashMap<String, PendingRequest>,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<SessionEvent>,
}

impl Inner {
    fn set_status(&self, state: &mut State, status: SessionStatus) {
        if state.status == status {
            return;
        }
        debug!("Session status {} -> {}", state.status.as_str(), status.as_str());
        state.status = status;
        let _ = self.events.send(SessionEvent::Status(status));
    }

    fn resolve_all(&self, state: &mut State, termination: &Termination) {
        if !state.pending.is_empty() {
            info!(
                "Resolving {} pending request(s) as {:?}",
                state.pending.len(),
                termination
            );
        }
        for (_, mut entry) in state.pending.drain() {
            entry.terminate(termination.clone());
        }
    }

    fn handle_inbound(&self, generation: u64, inbound: Inbound) {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!("Ignoring event from a previous connection");
            return;
        }

        match inbound {
            Inbound::Message(msg) => self.route(&mut state, msg),
            Inbound::Closed(error) => {
                // Already shut down; dropping it here does not re-enter
                let transport = state.transport.take();
                match error {
                    None => self.resolve_all(&mut state, &Termination::Cancelled),
                    Some(e) => {
                        self.set_status(&mut state, SessionStatus::Failed);
                        self.resolve_all(&mut state, &Termination::Failed(e));
                    }
                }
                self.set_status(&mut state, SessionStatus::Disconnected);
                drop(state);
                drop(transport);
            }
        }
    }

    fn route(&self, state: &mut State, msg: Message) {
        let raw_id = msg.id().map(str::to_string);

        let response = match Response::from_message(msg) {
            Ok(response) => response,
            Err(e) => {
                let entry = raw_id.as_ref().and_then(|id| state.pending.remove(id));
                match entry {
                    Some(mut entry) => {
                        warn!("Malformed reply for request {}: {}", entry.id, e);
                        entry.terminate(Termination::Failed(e.into()));
                    }
                    None => {
                        warn!("Malformed message from server: {}", e);
                        let _ = self.events.send(SessionEvent::Invalid(e.to_string()));
                    }
                }
                return;
            }
        };

        let entry = response
            .id
            .as_ref()
            .and_then(|id| state.pending.get_mut(id));
        let Some(entry) = entry else {
            debug!("Unclaimed message (id {:?})", response.id);
            let _ = self.events.send(SessionEvent::Notification(response));
            return;
        };

        let done = response.is_done();
        if !entry.cancelled {
            entry.sink.deliver(RequestEvent::Response(response));
        }

        if done {
            let id = entry.id.clone();
            if let Some(entry) = state.pending.remove(&id) {
                debug!(
                    "Request {} ({}) done after {:?}",
                    entry.id,
                    entry.op,
                    entry.elapsed()
                );
            }
        }
    }
}

/// One logical link to an nREPL server.
///
/// Cheap to clone; clones share the same connection and pending table.
/// Dropping the last clone closes the connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create a disconnected session and its event stream.
    pub fn new() -> (Self, SessionEvents) {
        let (events, rx) = broadcast::channel(EVENT_CAPACITY);
        let session = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    status: SessionStatus::Disconnected,
                    transport: None,
                    generation: 0,
                    next_id: 0,
                    pending: HashMap::new(),
                }),
                events,
            }),
        };
        (session, rx)
    }

    /// Another receiver for session events, starting from now.
    pub fn subscribe(&self) -> SessionEvents {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status
    }

    /// Number of requests still awaiting a terminal reply.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Connection generation; increases on every connect and disconnect.
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// `host:port` of the current connection.
    pub fn peer(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .transport
            .as_ref()
            .map(|t| t.peer().to_string())
    }

    /// Connect to `host:port`.
    ///
    /// Connecting an already connected session closes the old connection
    /// first, resolving its pending requests as cancelled. There is no
    /// retry; on failure the session is back in Disconnected.
    ///
    /// # Errors
    ///
    /// - `ConnectError::InProgress` if another connect is outstanding
    /// - any error from [`Transport::connect`]
    pub async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<(), ConnectError> {
        let (previous, generation) = {
            let mut state = self.inner.state.lock();
            if state.status == SessionStatus::Connecting {
                return Err(ConnectError::InProgress);
            }

            let previous = state.transport.take();
            if previous.is_some() {
                info!("Reconnecting: closing previous connection");
                self.inner.set_status(&mut state, SessionStatus::Closing);
                self.inner.resolve_all(&mut state, &Termination::Cancelled);
                self.inner.set_status(&mut state, SessionStatus::Disconnected);
            }

            state.generation += 1;
            self.inner.set_status(&mut state, SessionStatus::Connecting);
            (previous, state.generation)
        };
        // Old handler sees a stale generation and does nothing
        if let Some(previous) = previous {
            previous.close();
        }

        let result = Transport::connect(host, port, timeout).await;

        let mut state = self.inner.state.lock();
        if state.generation != generation {
            // disconnect() was called while we were connecting
            drop(state);
            drop(result);
            return Err(ConnectError::Io(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "connection attempt aborted by disconnect",
            )));
        }

        let transport = match result {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Failed to connect to {}:{}: {}", host, port, e);
                self.inner.set_status(&mut state, SessionStatus::Disconnected);
                return Err(e);
            }
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let registered = transport.on_receive(move |inbound| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_inbound(generation, inbound);
            }
        });
        if let Err(e) = registered {
            self.inner.set_status(&mut state, SessionStatus::Disconnected);
            drop(state);
            return Err(ConnectError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                e.to_string(),
            )));
        }

        state.transport = Some(transport);
        self.inner.set_status(&mut state, SessionStatus::Connected);
        Ok(())
    }

    /// Send `msg` with a freshly allocated id and return its reply stream.
    ///
    /// Returns as soon as the frame is queued.
    ///
    /// # Errors
    ///
    /// `TransportError::NotConnected` unless the session is Connected, or
    /// `TransportError::WriteFailed` if the frame cannot be queued.
    pub fn submit(&self, msg: Message) -> Result<RequestStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(msg, Sink::Stream(tx))?;
        Ok(RequestStream { id, rx })
    }

    /// Send `msg` and silently consume its replies.
    pub fn submit_detached(&self, msg: Message) -> Result<String, TransportError> {
        self.register(msg, Sink::Discard)
    }

    fn register(&self, msg: Message, sink: Sink) -> Result<String, TransportError> {
        let mut state = self.inner.state.lock();
        if state.status != SessionStatus::Connected {
            return Err(TransportError::NotConnected);
        }

        state.next_id += 1;
        let id = state.next_id.to_string();
        let msg = msg.with("id", id.as_str());
        let op = msg.op().unwrap_or_default().to_string();

        let transport = state.transport.as_ref().ok_or(TransportError::NotConnected)?;
        transport.send_message(&msg)?;
        debug!("-> {} (id {})", op, id);

        state.pending.insert(
            id.clone(),
            PendingRequest {
                id: id.clone(),
                op,
                submitted_at: Utc::now(),
                cancelled: false,
                sink,
            },
        );
        Ok(id)
    }

    /// Force-terminate request `id` locally with `Cancelled`.
    ///
    /// Later replies for the id are dropped until its `done` arrives.
    /// Returns false if the request is unknown or already cancelled.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock();
        match state.pending.get_mut(id) {
            Some(entry) if !entry.cancelled => {
                debug!("Cancelling request {} ({})", id, entry.op);
                entry.terminate(Termination::Cancelled);
                entry.cancelled = true;
                true
            }
            _ => false,
        }
    }

    /// Close the connection and cancel everything pending.
    ///
    /// Safe to call repeatedly; only the first call has an effect.
    pub fn disconnect(&self) {
        self.close_connection(None);
    }

    /// Disconnect only if the session is still on connection `generation`.
    ///
    /// Returns false, leaving the session alone, if a later connect or
    /// disconnect has already moved it on.
    pub fn disconnect_generation(&self, generation: u64) -> bool {
        self.close_connection(Some(generation))
    }

    fn close_connection(&self, expected: Option<u64>) -> bool {
        let transport = {
            let mut state = self.inner.state.lock();
            if expected.is_some_and(|g| g != state.generation) {
                return false;
            }
            match state.status {
                SessionStatus::Disconnected => return true,
                SessionStatus::Connecting => {
                    info!("Aborting connection attempt");
                    state.generation += 1;
                    self.inner.set_status(&mut state, SessionStatus::Disconnected);
                    return true;
                }
                _ => {}
            }
            state.generation += 1;
            self.inner.set_status(&mut state, SessionStatus::Closing);
            state.transport.take()
        };

        // Must run without the state lock: close() calls back into the handler
        if let Some(transport) = transport {
            transport.close();
        }

        let mut state = self.inner.state.lock();
        if state.status != SessionStatus::Disconnected {
            self.inner.resolve_all(&mut state, &Termination::Cancelled);
            self.inner.set_status(&mut state, SessionStatus::Disconnected);
        }
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Session")
            .field("status", &state.status)
            .field("generation", &state.generation)
            .field("pending", &state.pending.len())
            .finish()
    }
}
