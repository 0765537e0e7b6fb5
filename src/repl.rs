//! Evaluation coordinator: the public face of the client.
//!
//! [`Repl`] wraps a [`Session`] with the nREPL conversation a REPL front end
//! needs: the `clone` handshake on connect, `eval` with streamed events,
//! `interrupt`, and the tooling ops behind an editor's autocomplete and
//! symbol lookup.
//!
//! # Usage
//!
//! ```ignore
//! use chlorine_nrepl::{EvalOptions, Repl, ReplConfig};
//!
//! let (repl, _events) = Repl::new(ReplConfig::default());
//! repl.connect("127.0.0.1", 9192).await?;
//!
//! let mut stream = repl.evaluate("1 + 1", EvalOptions::default())?;
//! while let Some(event) = stream.next().await {
//!     println!("{:?}", event);
//! }
//! repl.disconnect();
//! ```

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ReplConfig;
use crate::models::{Completion, EvalEvent, SessionStatus, SymbolInfo};
use crate::nrepl::{
    ConnectError, Message, ProtocolError, ReplError, RequestEvent, RequestStream, Response,
    ResponseBody, Session, SessionEvents, Termination,
};

/// Optional context sent along with code to evaluate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalOptions {
    /// Namespace to evaluate in; falls back to the configured default.
    pub ns: Option<String>,
    /// Source file the code came from (used in remote stack traces).
    pub file: Option<String>,
    /// 1-based line of the code within `file`.
    pub line: Option<u32>,
    pub column: Option<u32>,
}

/// Identifies an in-flight evaluation for `interrupt`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EvalHandle {
    id: String,
}

impl EvalHandle {
    /// The wire id of the evaluation request.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Events of one evaluation, in arrival order.
///
/// Yields any number of output/value/exception events followed by exactly
/// one terminal event, then `None`. Not restartable.
#[derive(Debug)]
pub struct EvalStream {
    handle: EvalHandle,
    replies: RequestStream,
    queued: VecDeque<EvalEvent>,
    finished: bool,
}

impl EvalStream {
    fn new(replies: RequestStream) -> Self {
        Self {
            handle: EvalHandle {
                id: replies.id().to_string(),
            },
            replies,
            queued: VecDeque::new(),
            finished: false,
        }
    }

    pub fn handle(&self) -> EvalHandle {
        self.handle.clone()
    }

    /// Wait for the next event.
    pub async fn next(&mut self) -> Option<EvalEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                if event.is_terminal() {
                    self.finished = true;
                    self.queued.clear();
                }
                return Some(event);
            }
            if self.finished {
                return None;
            }

            match self.replies.recv().await {
                Some(RequestEvent::Response(response)) => {
                    self.queued.extend(eval_events(response));
                }
                Some(RequestEvent::Terminated(Termination::Cancelled)) => {
                    self.queued.push_back(EvalEvent::Cancelled);
                }
                Some(RequestEvent::Terminated(Termination::Failed(e))) => {
                    self.queued.push_back(EvalEvent::Failed {
                        error: e.to_string(),
                    });
                }
                // Session dropped underneath us
                None => self.queued.push_back(EvalEvent::Cancelled),
            }
        }
    }

    /// Drain the stream to its terminal event.
    pub async fn collect(mut self) -> EvalOutcome {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        EvalOutcome { events }
    }
}

/// Translate one reply into caller-facing events.
fn eval_events(response: Response) -> Vec<EvalEvent> {
    let mut events = Vec::new();
    let done = response.is_done();

    match response.body {
        ResponseBody::Value { value, ns } => events.push(EvalEvent::Value { value, ns }),
        ResponseBody::Out(text) => events.push(EvalEvent::Stdout { text }),
        ResponseBody::Err(text) => events.push(EvalEvent::Stderr { text }),
        ResponseBody::Exception { ex, root_ex } => {
            events.push(EvalEvent::Exception { ex, root_ex })
        }
        ResponseBody::StatusOnly => {}
        other => debug!("Ignoring non-eval reply body: {:?}", other),
    }

    if done {
        events.push(EvalEvent::Done {
            status: response.status,
        });
    }
    events
}

/// Everything an evaluation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalOutcome {
    pub events: Vec<EvalEvent>,
}

impl EvalOutcome {
    /// All values, in order.
    pub fn values(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                EvalEvent::Value { value, .. } => Some(value.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn last_value(&self) -> Option<&str> {
        self.values().pop()
    }

    /// Concatenated stdout.
    pub fn stdout(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match e {
                EvalEvent::Stdout { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated stderr.
    pub fn stderr(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match e {
                EvalEvent::Stderr { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The remote exception, if the evaluation raised.
    pub fn exception(&self) -> Option<&str> {
        self.events.iter().find_map(|e| match e {
            EvalEvent::Exception { ex, .. } => Some(ex.as_str()),
            _ => None,
        })
    }

    pub fn terminal(&self) -> Option<&EvalEvent> {
        self.events.last().filter(|e| e.is_terminal())
    }
}

/// Holds the connect-in-progress flag for the length of one attempt.
struct ConnectGuard<'a>(&'a AtomicBool);

impl<'a> ConnectGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// nREPL client for one server.
///
/// Cloning shares the connection.
#[derive(Debug, Clone)]
pub struct Repl {
    session: Session,
    config: ReplConfig,
    /// Server-side session id obtained from `clone`.
    server_session: Arc<Mutex<Option<String>>>,
    /// Set from the TCP connect until the `clone` handshake settles.
    connecting: Arc<AtomicBool>,
}

impl Repl {
    pub fn new(config: ReplConfig) -> (Self, SessionEvents) {
        let (session, events) = Session::new();
        let repl = Self {
            session,
            config,
            server_session: Arc::new(Mutex::new(None)),
            connecting: Arc::new(AtomicBool::new(false)),
        };
        (repl, events)
    }

    pub fn config(&self) -> &ReplConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn server_session(&self) -> Option<String> {
        self.server_session.lock().clone()
    }

    /// Connect using the configured timeout.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ReplError> {
        self.connect_with_timeout(host, port, self.config.connect_timeout())
            .await
    }

    /// Connect and open a server-side session with `clone`.
    ///
    /// An existing server session is closed before the old connection goes.
    /// If the handshake fails the connection is closed again.
    ///
    /// # Errors
    ///
    /// `ConnectError::InProgress` while another connect on this client has
    /// not finished its handshake; the running attempt is left alone.
    pub async fn connect_with_timeout(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), ReplError> {
        let _guard = ConnectGuard::try_acquire(&self.connecting).ok_or(ConnectError::InProgress)?;

        self.close_server_session();
        self.session.connect(host, port, timeout).await?;
        let generation = self.session.generation();

        match tokio::time::timeout(timeout, self.clone_session()).await {
            Ok(Ok(Some(id))) => {
                if self.session.generation() != generation {
                    return Err(ReplError::Cancelled);
                }
                info!("Opened server session {}", id);
                *self.server_session.lock() = Some(id);
                Ok(())
            }
            Ok(Ok(None)) => {
                warn!("Server did not return a session id; evaluations run in ephemeral sessions");
                Ok(())
            }
            Ok(Err(e)) => {
                self.abandon_handshake(generation);
                Err(e)
            }
            Err(_) => {
                self.abandon_handshake(generation);
                Err(ConnectError::Timeout(timeout).into())
            }
        }
    }

    /// Drop the connection a failed handshake ran on, unless it is already gone.
    fn abandon_handshake(&self, generation: u64) {
        if !self.session.disconnect_generation(generation) {
            debug!("Handshake connection already replaced; leaving session alone");
        }
    }

    /// Ask the server to close the session opened by the last handshake.
    fn close_server_session(&self) {
        let Some(id) = self.server_session.lock().take() else {
            return;
        };
        if !self.session.status().is_connected() {
            return;
        }
        let msg = Message::request("close").with("session", id.as_str());
        match self.session.submit_detached(msg) {
            Ok(_) => debug!("Closing server session {}", id),
            Err(e) => debug!("Could not close server session {}: {}", id, e),
        }
    }

    async fn clone_session(&self) -> Result<Option<String>, ReplError> {
        let replies = self.request(Message::request("clone")).await?;
        Ok(replies.into_iter().find_map(|r| match r.body {
            ResponseBody::NewSession(id) => Some(id),
            _ => None,
        }))
    }

    /// Submit `code` for evaluation.
    ///
    /// # Errors
    ///
    /// `ReplError::Transport` if the session is not connected. Failures after
    /// submission arrive on the returned stream instead.
    pub fn evaluate(&self, code: &str, options: EvalOptions) -> Result<EvalStream, ReplError> {
        let ns = options.ns.or_else(|| self.config.default_ns.clone());
        let msg = Message::request("eval")
            .with("code", code)
            .with_opt("ns", ns)
            .with_opt("file", options.file)
            .with_opt("line", options.line)
            .with_opt("column", options.column)
            .with_opt("session", self.server_session());

        let replies = self.session.submit(msg)?;
        debug!("Evaluating as request {}", replies.id());
        Ok(EvalStream::new(replies))
    }

    /// Interrupt an evaluation.
    ///
    /// The stream ends with `Cancelled` immediately; the server is asked to
    /// stop, but whether it does is up to the remote runtime.
    pub fn interrupt(&self, handle: &EvalHandle) -> Result<(), ReplError> {
        if !self.session.cancel(&handle.id) {
            debug!("Request {} already finished; nothing to interrupt", handle.id);
            return Ok(());
        }

        let msg = Message::request("interrupt")
            .with("interrupt-id", handle.id.as_str())
            .with_opt("session", self.server_session());
        self.session.submit_detached(msg)?;
        info!("Interrupt sent for request {}", handle.id);
        Ok(())
    }

    /// Close the server session and the connection. Idempotent.
    pub fn disconnect(&self) {
        self.close_server_session();
        self.session.disconnect();
    }

    /// Ask the server what it supports.
    pub async fn describe(&self) -> Result<Message, ReplError> {
        let replies = self.request(self.with_session(Message::request("describe"))).await?;
        replies
            .into_iter()
            .find_map(|r| match r.body {
                ResponseBody::Describe(msg) => Some(msg),
                _ => None,
            })
            .ok_or_else(|| {
                ProtocolError::UnexpectedType {
                    field: "describe reply".to_string(),
                    expected: "dict with ops",
                }
                .into()
            })
    }

    /// Completion candidates for `prefix`.
    pub async fn completions(
        &self,
        prefix: &str,
        ns: Option<&str>,
    ) -> Result<Vec<Completion>, ReplError> {
        let msg = Message::request("completions")
            .with("prefix", prefix)
            .with_opt("ns", self.ns_or_default(ns));
        let replies = self.request(self.with_session(msg)).await?;

        Ok(replies
            .into_iter()
            .flat_map(|r| match r.body {
                ResponseBody::Completions(items) => items,
                _ => Vec::new(),
            })
            .collect())
    }

    /// Metadata for `symbol`, or `None` if the server does not know it.
    pub async fn lookup(
        &self,
        symbol: &str,
        ns: Option<&str>,
    ) -> Result<Option<SymbolInfo>, ReplError> {
        let msg = Message::request("lookup")
            .with("sym", symbol)
            .with_opt("ns", self.ns_or_default(ns));
        let replies = self.request(self.with_session(msg)).await?;

        Ok(replies.into_iter().find_map(|r| match r.body {
            ResponseBody::Info(info) => info,
            _ => None,
        }))
    }

    /// Send a whole file for evaluation with `load-file`.
    pub async fn load_file(&self, path: &Path) -> Result<EvalStream, ReplError> {
        let contents = tokio::fs::read_to_string(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let msg = Message::request("load-file")
            .with("file", contents)
            .with("file-path", path.display().to_string())
            .with("file-name", file_name)
            .with_opt("session", self.server_session());

        let replies = self.session.submit(msg)?;
        debug!("Loading {} as request {}", path.display(), replies.id());
        Ok(EvalStream::new(replies))
    }

    fn with_session(&self, msg: Message) -> Message {
        msg.with_opt("session", self.server_session())
    }

    fn ns_or_default(&self, ns: Option<&str>) -> Option<String> {
        ns.map(str::to_string)
            .or_else(|| self.config.default_ns.clone())
    }

    /// Send a request and gather its replies up to `done`.
    async fn request(&self, msg: Message) -> Result<Vec<Response>, ReplError> {
        let op = msg.op().unwrap_or_default().to_string();
        let mut replies = self.session.submit(msg)?;
        let mut collected = Vec::new();

        loop {
            match replies.recv().await {
                Some(RequestEvent::Response(response)) => {
                    let done = response.is_done();
                    if response.is_error() {
                        return Err(ReplError::Remote {
                            op,
                            status: response.status.join(", "),
                        });
                    }
                    collected.push(response);
                    if done {
                        return Ok(collected);
                    }
                }
                Some(RequestEvent::Terminated(Termination::Cancelled)) | None => {
                    return Err(ReplError::Cancelled)
                }
                Some(RequestEvent::Terminated(Termination::Failed(e))) => return Err(e.into()),
            }
        }
    }
}
