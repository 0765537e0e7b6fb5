//! nREPL protocol client for communication with a running runtime.
//!
//! This module provides the network side of the REPL: bencode framing, the
//! TCP transport, and the session state machine that matches replies to
//! requests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐            TCP             ┌─────────────────────┐
//! │   Repl/Session  │  ◄───────────────────────► │    nREPL server     │
//! │   (this crate)  │   bencode dictionaries     │  (e.g. port 9192)   │
//! └─────────────────┘                            └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Every message is one bencode dictionary. Requests carry `op` and `id`;
//! the server answers with any number of replies echoing the `id`, the last
//! of which has `done` in its `status` list:
//!
//! ```text
//! -> d4:code5:1 + 12:id1:12:op4:evale
//! <- d2:id1:12:ns4:user5:value1:2e
//! <- d2:id1:16:statusl4:doneee
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use chlorine_nrepl::nrepl::{Message, Session};
//! use std::time::Duration;
//!
//! let (session, _events) = Session::new();
//! session.connect("127.0.0.1", 9192, Duration::from_secs(5)).await?;
//! let mut replies = session.submit(Message::request("describe"))?;
//! while let Some(event) = replies.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

pub mod bencode;
mod error;
mod message;
mod session;
mod transport;

pub use bencode::{decode, encode, Decoder};
pub use error::{ConnectError, ProtocolError, ReplError, SessionError, TransportError};
pub use message::{Message, Response, ResponseBody, Value, STATUS_DONE};
pub use session::{
    PendingRequest, RequestEvent, RequestStream, Session, SessionEvents, Termination,
    EVENT_CAPACITY,
};
pub use transport::{Connection, Inbound, Transport};
