//! In-process fake nREPL server for integration tests.
//!
//! Speaks real bencode over TCP and answers a small scripted vocabulary:
//!
//! | Request                   | Replies                                            |
//! |---------------------------|----------------------------------------------------|
//! | `clone`                   | `new-session`, done                                |
//! | `describe`                | `ops` map, done                                    |
//! | `eval "1 + 1"`            | value `2`, done                                    |
//! | `eval "(/ 1 0)"`          | `ex` + eval-error, `err`, done                     |
//! | `eval "(puts ...)"`       | `out`, value `nil`, done                           |
//! | `eval "(sleep)"`          | nothing (runs forever)                             |
//! | `eval "(hold N)"`         | nothing until `(release)`                          |
//! | `eval "(release)"`        | replies for held evals in reverse order, then done |
//! | `eval "(notify)"`         | an id-less `out`, then value + done                |
//! | `eval "(bad-value)"`      | a reply whose `value` is an integer                |
//! | `eval "(garbage)"`        | corrupt bytes                                      |
//! | `eval <other>`            | value = code, done                                 |
//! | `interrupt`               | done+interrupted for the target, done              |
//! | `completions`, `lookup`   | canned answers                                     |
//! | `load-file`               | value `loaded <file-name>`, done                   |
//! | `close`                   | done                                               |
//! | anything else             | error, unknown-op, done                            |
//!
//! [`FakeServer::with_ops`] restricts the vocabulary; ops left out are
//! answered as unknown. [`FakeServer::ignoring`] records the listed ops but
//! never answers them.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use chlorine_nrepl::nrepl::{encode, Decoder, Message, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Test timeout to prevent hanging tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const SERVER_SESSION: &str = "fake-session-1";

pub struct FakeServer {
    pub port: u16,
    /// Every request received, across all connections.
    pub requests: mpsc::UnboundedReceiver<Message>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn spawn() -> Self {
        Self::start(None, &[]).await
    }

    /// A server that only understands `ops`.
    pub async fn with_ops(ops: &'static [&'static str]) -> Self {
        Self::start(Some(ops), &[]).await
    }

    /// A server that leaves every request for `ops` unanswered.
    pub async fn ignoring(ops: &'static [&'static str]) -> Self {
        Self::start(None, ops).await
    }

    async fn start(ops: Option<&'static [&'static str]>, ignored: &'static [&'static str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake server");
        let port = listener.local_addr().unwrap().port();
        let (tx, requests) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, tx.clone(), ops, ignored));
            }
        });

        Self {
            port,
            requests,
            task,
        }
    }

    /// Wait for the next request with the given op, skipping others.
    pub async fn expect_op(&mut self, op: &str) -> Message {
        loop {
            let msg = tokio::time::timeout(TEST_TIMEOUT, self.requests.recv())
                .await
                .expect("Timed out waiting for request")
                .expect("Fake server stopped");
            if msg.op() == Some(op) {
                return msg;
            }
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn status(flags: &[&str]) -> Value {
    Value::List(flags.iter().map(|f| Value::from(*f)).collect())
}

fn reply(request: &Message) -> Message {
    let mut msg = Message::default();
    if let Some(id) = request.id() {
        msg = msg.with("id", id);
    }
    if let Some(session) = request.session() {
        msg = msg.with("session", session);
    }
    msg
}

fn done(request: &Message) -> Message {
    reply(request).with("status", status(&["done"]))
}

async fn serve_connection(
    mut stream: TcpStream,
    seen: mpsc::UnboundedSender<Message>,
    ops: Option<&'static [&'static str]>,
    ignored: &'static [&'static str],
) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 4096];
    let mut held: Vec<Message> = Vec::new();

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.push(&buf[..n]);

        while let Ok(Some(request)) = decoder.next_message() {
            let _ = seen.send(request.clone());
            let mut out = Vec::new();

            let op = request.op().unwrap_or_default();
            let supported = ops.map_or(true, |ops| ops.iter().any(|o| *o == op));
            if ignored.iter().any(|o| *o == op) {
                continue;
            }

            match op {
                _ if !supported => {
                    out.push(reply(&request).with("status", status(&["error", "unknown-op", "done"])));
                }
                "clone" => {
                    out.push(
                        reply(&request)
                            .with("new-session", SERVER_SESSION)
                            .with("status", status(&["done"])),
                    );
                }
                "describe" => {
                    let mut ops = BTreeMap::new();
                    for name in ["clone", "close", "describe", "eval", "interrupt", "load-file"] {
                        ops.insert(name.to_string(), Value::Dict(BTreeMap::new()));
                    }
                    out.push(
                        reply(&request)
                            .with("ops", ops)
                            .with("status", status(&["done"])),
                    );
                }
                "eval" => {
                    let code = request.get_str("code").unwrap_or_default().to_string();
                    match code.as_str() {
                        "1 + 1" => {
                            out.push(reply(&request).with("value", "2").with("ns", "user"));
                            out.push(done(&request));
                        }
                        "(/ 1 0)" => {
                            out.push(
                                reply(&request)
                                    .with("ex", "ZeroDivisionError")
                                    .with("root-ex", "ZeroDivisionError")
                                    .with("status", status(&["eval-error"])),
                            );
                            out.push(reply(&request).with("err", "divided by 0\n"));
                            out.push(done(&request));
                        }
                        "(sleep)" => {}
                        "(release)" => {
                            for held_request in held.drain(..).rev() {
                                let label = held_request
                                    .get_str("code")
                                    .unwrap_or_default()
                                    .to_string();
                                out.push(reply(&held_request).with("out", format!("{}\n", label)));
                                out.push(reply(&held_request).with("value", label));
                                out.push(done(&held_request));
                            }
                            out.push(done(&request));
                        }
                        "(notify)" => {
                            out.push(Message::default().with("out", "server notice\n"));
                            out.push(reply(&request).with("value", "nil"));
                            out.push(done(&request));
                        }
                        "(bad-value)" => {
                            out.push(reply(&request).with("value", 42i64));
                        }
                        "(garbage)" => {
                            let _ = stream.write_all(b"d2:id1:1!!!").await;
                            return;
                        }
                        _ if code.starts_with("(hold") => held.push(request.clone()),
                        _ if code.starts_with("(puts") => {
                            out.push(reply(&request).with("out", "hello\n"));
                            out.push(reply(&request).with("value", "nil"));
                            out.push(done(&request));
                        }
                        _ => {
                            out.push(reply(&request).with("value", code.clone()));
                            out.push(done(&request));
                        }
                    }
                }
                "interrupt" => {
                    if let Some(target) = request.get_str("interrupt-id") {
                        out.push(
                            Message::default()
                                .with("id", target)
                                .with("session", SERVER_SESSION)
                                .with("status", status(&["done", "interrupted"])),
                        );
                        held.retain(|h| h.id() != Some(target));
                    }
                    out.push(done(&request));
                }
                "completions" => {
                    let prefix = request.get_str("prefix").unwrap_or_default();
                    let mut entry = BTreeMap::new();
                    entry.insert("candidate".to_string(), Value::from(format!("{}-one", prefix)));
                    entry.insert("type".to_string(), Value::from("function"));
                    out.push(
                        reply(&request)
                            .with(
                                "completions",
                                vec![Value::Dict(entry), Value::from(format!("{}-two", prefix))],
                            )
                            .with("status", status(&["done"])),
                    );
                }
                "lookup" => {
                    let mut info = BTreeMap::new();
                    if request.get_str("sym") == Some("hello") {
                        info.insert("name".to_string(), Value::from("hello"));
                        info.insert("ns".to_string(), Value::from("Person"));
                        info.insert("doc".to_string(), Value::from("Greets someone"));
                        info.insert("arglists-str".to_string(), Value::from("(greeting)"));
                        info.insert("line".to_string(), Value::Int(9));
                    }
                    out.push(
                        reply(&request)
                            .with("info", info)
                            .with("status", status(&["done"])),
                    );
                }
                "load-file" => {
                    let name = request.get_str("file-name").unwrap_or_default().to_string();
                    out.push(reply(&request).with("value", format!("loaded {}", name)));
                    out.push(done(&request));
                }
                "close" => {
                    out.push(reply(&request).with("status", status(&["done", "session-closed"])));
                }
                _ => {
                    out.push(reply(&request).with("status", status(&["error", "unknown-op", "done"])));
                }
            }

            for msg in out {
                if stream.write_all(&encode(&msg)).await.is_err() {
                    return;
                }
            }
        }
    }
}
