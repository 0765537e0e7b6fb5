//! Chlorine nREPL client library
//!
//! This library provides the REPL core behind the `connect-socket-repl`
//! command:
//!
//! - `nrepl` - bencode framing, TCP transport and the session state machine
//! - `repl` - evaluation coordinator (`Repl`) with streamed evaluation events
//! - `models` - event and status types handed to the host environment
//! - `config` - connection defaults from file, environment and `.nrepl-port`
//!
//! # Repl
//!
//! The `Repl` type is the recommended entry point:
//!
//! ```ignore
//! use chlorine_nrepl::{EvalOptions, Repl, ReplConfig};
//!
//! let (repl, _events) = Repl::new(ReplConfig::load()?);
//! repl.connect("127.0.0.1", 9192).await?;
//! let outcome = repl.evaluate("1 + 1", EvalOptions::default())?.collect().await;
//! assert_eq!(outcome.last_value(), Some("2"));
//! ```

pub mod config;
pub mod models;
pub mod nrepl;
pub mod repl;

pub use config::ReplConfig;
pub use models::{Completion, EvalEvent, SessionEvent, SessionStatus, SymbolInfo};
pub use repl::{EvalHandle, EvalOptions, EvalOutcome, EvalStream, Repl};
