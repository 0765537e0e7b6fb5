//! nREPL message model.
//!
//! A [`Message`] is the top-level bencode dictionary exchanged on the wire.
//! Inbound messages are additionally classified into a [`Response`], whose
//! [`ResponseBody`] is validated when it is built. Anything that does not
//! match a known shape is kept verbatim as [`ResponseBody::Unknown`].

use std::collections::BTreeMap;

use crate::models::{Completion, SymbolInfo};
use crate::nrepl::error::ProtocolError;

/// A bencode value.
///
/// Byte strings that are valid UTF-8 are always represented as `Str`; `Bytes`
/// only ever holds non-UTF-8 payloads. Use [`Value::from_bytes`] to build a
/// byte string so that decoding an encoded value yields the same variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    /// Build a byte-string value, preferring `Str` when the bytes are UTF-8.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(s) => Value::Str(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Dict(map)
    }
}

/// One nREPL protocol message (a top-level dictionary).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: BTreeMap<String, Value>,
}

impl Message {
    /// Start a request for `op`.
    pub fn request(op: &str) -> Self {
        Self::default().with("op", op)
    }

    pub fn from_fields(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    /// Builder: set `key` to `value`.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Builder: set `key` only when `value` is present.
    pub fn with_opt<V: Into<Value>>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }

    pub fn id(&self) -> Option<&str> {
        self.get_str("id")
    }

    pub fn op(&self) -> Option<&str> {
        self.get_str("op")
    }

    pub fn session(&self) -> Option<&str> {
        self.get_str("session")
    }

    /// Status flags (`status` is a list of strings in nREPL).
    pub fn status(&self) -> Vec<String> {
        match self.get("status") {
            Some(Value::List(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::Str(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }
}

/// Status flag that marks the last response for a request id.
pub const STATUS_DONE: &str = "done";

/// Classified body of an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Result of an evaluated form.
    Value { value: String, ns: Option<String> },
    /// Captured standard output.
    Out(String),
    /// Captured standard error.
    Err(String),
    /// The remote runtime raised while evaluating.
    Exception { ex: String, root_ex: Option<String> },
    /// Reply to `clone`.
    NewSession(String),
    /// Reply to `completions`.
    Completions(Vec<Completion>),
    /// Reply to `lookup`; `None` when the symbol is unknown.
    Info(Option<SymbolInfo>),
    /// Reply to `describe`.
    Describe(Message),
    /// Carries nothing but status flags.
    StatusOnly,
    /// Anything else, kept as received.
    Unknown(Message),
}

/// A decoded inbound message with its routing fields pulled out.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<String>,
    pub session: Option<String>,
    pub status: Vec<String>,
    pub body: ResponseBody,
}

impl Response {
    /// Classify `msg`, validating the fields of the recognised shapes.
    pub fn from_message(msg: Message) -> Result<Self, ProtocolError> {
        let id = optional_str(&msg, "id")?;
        let session = optional_str(&msg, "session")?;
        let status = match msg.get("status") {
            None => Vec::new(),
            Some(Value::List(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        ProtocolError::UnexpectedType {
                            field: "status".to_string(),
                            expected: "list of strings",
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(ProtocolError::UnexpectedType {
                    field: "status".to_string(),
                    expected: "list of strings",
                })
            }
        };

        let body = classify(msg)?;

        Ok(Self {
            id,
            session,
            status,
            body,
        })
    }

    pub fn is_done(&self) -> bool {
        self.has_status(STATUS_DONE)
    }

    pub fn has_status(&self, flag: &str) -> bool {
        self.status.iter().any(|s| s == flag)
    }

    /// The server reported a failure for the request itself (unknown op etc.),
    /// as opposed to an evaluation error.
    pub fn is_error(&self) -> bool {
        self.has_status("error") || self.has_status("unknown-op")
    }
}

fn optional_str(msg: &Message, field: &str) -> Result<Option<String>, ProtocolError> {
    match msg.get(field) {
        None => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ProtocolError::UnexpectedType {
            field: field.to_string(),
            expected: "string",
        }),
    }
}

fn required_str(msg: &Message, field: &str) -> Result<String, ProtocolError> {
    optional_str(msg, field)?.ok_or_else(|| ProtocolError::UnexpectedType {
        field: field.to_string(),
        expected: "string",
    })
}

fn classify(msg: Message) -> Result<ResponseBody, ProtocolError> {
    if msg.get("value").is_some() {
        return Ok(ResponseBody::Value {
            value: required_str(&msg, "value")?,
            ns: optional_str(&msg, "ns")?,
        });
    }
    if msg.get("out").is_some() {
        return Ok(ResponseBody::Out(required_str(&msg, "out")?));
    }
    if msg.get("err").is_some() {
        return Ok(ResponseBody::Err(required_str(&msg, "err")?));
    }
    if msg.get("ex").is_some() {
        return Ok(ResponseBody::Exception {
            ex: required_str(&msg, "ex")?,
            root_ex: optional_str(&msg, "root-ex")?,
        });
    }
    if msg.get("new-session").is_some() {
        return Ok(ResponseBody::NewSession(required_str(&msg, "new-session")?));
    }
    if let Some(value) = msg.get("completions") {
        return parse_completions(value).map(ResponseBody::Completions);
    }
    if let Some(value) = msg.get("info") {
        return parse_info(value).map(ResponseBody::Info);
    }
    if msg.get("ops").is_some() {
        return Ok(ResponseBody::Describe(msg));
    }

    let routing_only = msg
        .fields()
        .keys()
        .all(|k| matches!(k.as_str(), "id" | "session" | "status"));
    if routing_only && msg.get("status").is_some() {
        Ok(ResponseBody::StatusOnly)
    } else {
        Ok(ResponseBody::Unknown(msg))
    }
}

fn parse_completions(value: &Value) -> Result<Vec<Completion>, ProtocolError> {
    let items = value.as_list().ok_or_else(|| ProtocolError::UnexpectedType {
        field: "completions".to_string(),
        expected: "list",
    })?;

    items
        .iter()
        .map(|item| match item {
            // Some servers send bare candidate strings
            Value::Str(s) => Ok(Completion {
                candidate: s.clone(),
                ns: None,
                kind: None,
            }),
            Value::Dict(map) => {
                let candidate = map
                    .get("candidate")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProtocolError::UnexpectedType {
                        field: "completions.candidate".to_string(),
                        expected: "string",
                    })?;
                Ok(Completion {
                    candidate: candidate.to_string(),
                    ns: map.get("ns").and_then(Value::as_str).map(str::to_string),
                    kind: map.get("type").and_then(Value::as_str).map(str::to_string),
                })
            }
            _ => Err(ProtocolError::UnexpectedType {
                field: "completions".to_string(),
                expected: "list of dicts",
            }),
        })
        .collect()
}

fn parse_info(value: &Value) -> Result<Option<SymbolInfo>, ProtocolError> {
    let map = value.as_dict().ok_or_else(|| ProtocolError::UnexpectedType {
        field: "info".to_string(),
        expected: "dict",
    })?;
    if map.is_empty() {
        return Ok(None);
    }

    let text = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
    let line = map.get("line").and_then(|v| match v {
        Value::Int(i) => u32::try_from(*i).ok(),
        Value::Str(s) => s.parse().ok(),
        _ => None,
    });

    Ok(Some(SymbolInfo {
        name: text("name").unwrap_or_default(),
        ns: text("ns"),
        doc: text("doc"),
        arglists: text("arglists-str"),
        file: text("file"),
        line,
    }))
}
