//! TCP transport for one nREPL connection.
//!
//! The transport is the only owner of the socket. After `connect` the stream
//! is split: a writer task drains a queue of encoded frames, and (once a
//! handler is registered with [`Transport::on_receive`]) a reader task feeds
//! socket reads through the bencode [`Decoder`] and hands every message to
//! the handler. When the connection ends for any reason the handler gets one
//! final [`Inbound::Closed`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::SessionStatus;
use crate::nrepl::bencode::{self, Decoder};
use crate::nrepl::error::{ConnectError, SessionError, TransportError};
use crate::nrepl::message::Message;

/// Socket read size.
const READ_CHUNK: usize = 8 * 1024;

/// Upper bound for a single frame write before the connection is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// What the transport delivers to its handler.
#[derive(Debug)]
pub enum Inbound {
    /// One decoded message, in wire order.
    Message(Message),
    /// The connection ended. `None` for a local `close()`.
    Closed(Option<SessionError>),
}

type Handler = Box<dyn FnMut(Inbound) + Send>;

/// The registered handler and a close notification that arrived while it was
/// out of the slot.
///
/// `dispatch` takes the handler out before calling it, so the handler may
/// drop the last reference to its owner (and with it this transport) without
/// re-entering a held lock. A `shutdown` that finds the slot empty parks its
/// reason in `deferred_close` and `dispatch` delivers it.
#[derive(Default)]
struct HandlerSlot {
    handler: Option<Handler>,
    deferred_close: Option<Option<SessionError>>,
}

/// Snapshot of the connection owned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub host: String,
    pub port: u16,
    pub status: SessionStatus,
}

/// State shared between the transport handle and its tasks.
struct Shared {
    peer: String,
    status: Mutex<SessionStatus>,
    handler: Mutex<HandlerSlot>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn is_connected(&self) -> bool {
        *self.status.lock() == SessionStatus::Connected
    }

    /// Tear the connection down exactly once and notify the handler.
    ///
    /// A local close (`error == None`) lets the writer flush what is already
    /// queued; an error close aborts both tasks.
    fn shutdown(&self, error: Option<SessionError>) {
        {
            let mut status = self.status.lock();
            if *status == SessionStatus::Disconnected {
                return;
            }
            *status = SessionStatus::Disconnected;
        }

        match &error {
            None => info!("Closing connection to {}", self.peer),
            Some(e) => warn!("Connection to {} lost: {}", self.peer, e),
        }

        // Dropping the sender ends the writer loop once the queue is drained
        self.write_tx.lock().take();
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        if error.is_some() {
            if let Some(task) = self.writer_task.lock().take() {
                task.abort();
            }
        }

        let handler = {
            let mut slot = self.handler.lock();
            let handler = slot.handler.take();
            if handler.is_none() {
                slot.deferred_close = Some(error.clone());
            }
            handler
        };
        if let Some(mut handler) = handler {
            handler(Inbound::Closed(error));
        }
    }

    /// Hand a message to the handler; returns false once the connection is gone.
    ///
    /// The handler runs with the slot unlocked.
    fn dispatch(&self, msg: Message) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(mut handler) = self.handler.lock().handler.take() else {
            return true;
        };
        handler(Inbound::Message(msg));

        let mut slot = self.handler.lock();
        match slot.deferred_close.take() {
            // Shut down while the handler was running
            Some(error) => {
                drop(slot);
                handler(Inbound::Closed(error));
                false
            }
            None => {
                slot.handler = Some(handler);
                true
            }
        }
    }
}

/// One TCP connection to an nREPL server.
///
/// # Resource Safety
///
/// The socket halves live only inside the reader and writer tasks. `close()`
/// (also run by `Drop`) stops both, so the socket is released on normal
/// close, on error, and when the transport is dropped.
pub struct Transport {
    host: String,
    port: u16,
    shared: Arc<Shared>,
    reader: Mutex<Option<OwnedReadHalf>>,
}

impl Transport {
    /// Open a connection to `host:port`.
    ///
    /// No retry is attempted; the caller owns the retry policy.
    ///
    /// # Errors
    ///
    /// - `ConnectError::DnsFailure` if `host` does not resolve
    /// - `ConnectError::Refused` if nothing is listening
    /// - `ConnectError::Timeout` if the attempt exceeds `timeout`
    /// - `ConnectError::Io` for any other socket error
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ConnectError> {
        let peer = format!("{}:{}", host, port);
        debug!("Connecting to {} (timeout {:?})", peer, timeout);

        let stream = match tokio::time::timeout(timeout, open_stream(host, port, &peer, timeout)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(ConnectError::Timeout(timeout)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY on {}: {}", peer, e);
        }

        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            peer: peer.clone(),
            status: Mutex::new(SessionStatus::Connected),
            handler: Mutex::new(HandlerSlot::default()),
            write_tx: Mutex::new(Some(write_tx)),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        });

        let writer = tokio::spawn(writer_loop(write_half, write_rx, Arc::clone(&shared)));
        *shared.writer_task.lock() = Some(writer);

        info!("Connected to nREPL server at {}", peer);

        Ok(Self {
            host: host.to_string(),
            port,
            shared,
            reader: Mutex::new(Some(read_half)),
        })
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.lock()
    }

    pub fn connection(&self) -> Connection {
        Connection {
            host: self.host.clone(),
            port: self.port,
            status: self.status(),
        }
    }

    /// `host:port` of the server.
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Register the inbound handler and start reading.
    ///
    /// The handler runs on the reader task, once per decoded message, and
    /// once more with `Inbound::Closed` when the connection ends.
    ///
    /// # Errors
    ///
    /// - `TransportError::NotConnected` if the connection is closed
    /// - `TransportError::HandlerRegistered` if a handler was already registered
    pub fn on_receive<F>(&self, handler: F) -> Result<(), TransportError>
    where
        F: FnMut(Inbound) + Send + 'static,
    {
        if !self.shared.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let Some(read_half) = self.reader.lock().take() else {
            return Err(TransportError::HandlerRegistered);
        };

        self.shared.handler.lock().handler = Some(Box::new(handler));
        let task = tokio::spawn(reader_loop(read_half, Arc::clone(&self.shared)));
        *self.shared.reader_task.lock() = Some(task);
        Ok(())
    }

    /// Queue an encoded frame for writing. Never waits on the network.
    ///
    /// # Errors
    ///
    /// - `TransportError::NotConnected` if the connection is not Connected
    /// - `TransportError::WriteFailed` if the writer task has stopped
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.shared.is_connected() {
            return Err(TransportError::NotConnected);
        }
        match self.shared.write_tx.lock().as_ref() {
            Some(tx) => tx
                .send(bytes)
                .map_err(|_| TransportError::WriteFailed("Writer task has stopped".to_string())),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Encode and queue a message.
    pub fn send_message(&self, msg: &Message) -> Result<(), TransportError> {
        self.send(bencode::encode(msg))
    }

    /// Close the connection. Calling it again has no further effect.
    pub fn close(&self) {
        self.shared.shutdown(None);
        // Unregistered reader half: drop it here so the socket is released
        self.reader.lock().take();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolve and connect, trying each resolved address in turn.
async fn open_stream(
    host: &str,
    port: u16,
    peer: &str,
    timeout: Duration,
) -> Result<TcpStream, ConnectError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ConnectError::DnsFailure {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    let mut last_error = None;
    for addr in &addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(ConnectError::from_io(e, peer, timeout)),
        None => Err(ConnectError::DnsFailure {
            host: host.to_string(),
            reason: "no addresses found".to_string(),
        }),
    }
}

async fn reader_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    let mut decoder = Decoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                shared.shutdown(Some(
                    TransportError::ConnectionReset("Connection closed by server".to_string())
                        .into(),
                ));
                return;
            }
            Ok(n) => n,
            Err(e) => {
                shared.shutdown(Some(TransportError::ConnectionReset(e.to_string()).into()));
                return;
            }
        };

        decoder.push(&chunk[..n]);
        loop {
            match decoder.next_message() {
                Ok(Some(msg)) => {
                    debug!("<- {:?}", msg.fields());
                    if !shared.dispatch(msg) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to decode message from {}: {}", shared.peer, e);
                    shared.shutdown(Some(e.into()));
                    return;
                }
            }
        }
    }
}

async fn writer_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    while let Some(frame) = rx.recv().await {
        let result = tokio::time::timeout(WRITE_TIMEOUT, async {
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await;

        let failure = match result {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("write stalled for {:?}", WRITE_TIMEOUT),
        };
        shared.shutdown(Some(TransportError::WriteFailed(failure).into()));
        return;
    }

    // Sender dropped by close(): everything queued has been written
    if let Err(e) = writer.shutdown().await {
        debug!("Error shutting down write half: {}", e);
    }
}
