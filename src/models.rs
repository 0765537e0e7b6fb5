//! Caller-facing data models.
//!
//! These are the types the host environment consumes: per-evaluation events,
//! session status, and the results of the tooling ops. They serialize with
//! serde so the CLI can emit them as JSON lines.

use serde::{Deserialize, Serialize};

use crate::nrepl::Response;

/// Lifecycle state of a session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Disconnected => "Disconnected",
            SessionStatus::Connecting => "Connecting",
            SessionStatus::Connected => "Connected",
            SessionStatus::Closing => "Closing",
            SessionStatus::Failed => "Failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionStatus::Connected)
    }
}

/// Session-wide events: status changes and messages no request claimed.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The connection moved to a new state.
    Status(SessionStatus),
    /// A server-initiated message, or one whose id is not pending.
    Notification(Response),
    /// A message that failed validation and had no pending request to fail.
    Invalid(String),
}

/// One event in an evaluation's stream.
///
/// Every stream ends with exactly one terminal event (`Done`, `Cancelled`
/// or `Failed`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvalEvent {
    Stdout {
        text: String,
    },
    Stderr {
        text: String,
    },
    Value {
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ns: Option<String>,
    },
    /// The remote runtime raised; this is a normal result, not a client fault.
    Exception {
        ex: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root_ex: Option<String>,
    },
    Done {
        status: Vec<String>,
    },
    Cancelled,
    Failed {
        error: String,
    },
}

impl EvalEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvalEvent::Done { .. } | EvalEvent::Cancelled | EvalEvent::Failed { .. }
        )
    }
}

/// A completion candidate returned by the `completions` op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub candidate: String,
    #[serde(default)]
    pub ns: Option<String>,
    /// Candidate kind as reported by the server (`function`, `var`, ...).
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Symbol metadata returned by the `lookup` op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    #[serde(default)]
    pub ns: Option<String>,
    #[serde(default)]
    pub doc: Option<String>,
    #[serde(default)]
    pub arglists: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}
