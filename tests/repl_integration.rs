//! Integration tests for the evaluation coordinator against a fake nREPL server.

mod common;

use std::time::Duration;

use chlorine_nrepl::nrepl::{ConnectError, ReplError, Value};
use chlorine_nrepl::{EvalEvent, EvalOptions, Repl, ReplConfig, SessionStatus};
use common::{FakeServer, SERVER_SESSION, TEST_TIMEOUT};
use pretty_assertions::assert_eq;
use tokio::time::timeout;

fn config(server: &FakeServer) -> ReplConfig {
    ReplConfig {
        port: server.port,
        ..ReplConfig::default()
    }
}

async fn connected(server: &FakeServer) -> Repl {
    connected_with(config(server)).await
}

async fn connected_with(config: ReplConfig) -> Repl {
    let (repl, _events) = Repl::new(config.clone());
    timeout(TEST_TIMEOUT, repl.connect(&config.host, config.port))
        .await
        .expect("Test timed out")
        .expect("Connect failed");
    repl
}

async fn eval(repl: &Repl, code: &str) -> chlorine_nrepl::EvalOutcome {
    let stream = repl.evaluate(code, EvalOptions::default()).unwrap();
    timeout(TEST_TIMEOUT, stream.collect())
        .await
        .expect("Test timed out")
}

#[tokio::test]
async fn test_connect_opens_server_session() {
    let mut server = FakeServer::spawn().await;
    let repl = connected(&server).await;

    server.expect_op("clone").await;
    assert_eq!(repl.status(), SessionStatus::Connected);
    assert_eq!(repl.server_session().as_deref(), Some(SERVER_SESSION));
}

#[tokio::test]
async fn test_eval_value_then_done() {
    let server = FakeServer::spawn().await;
    let repl = connected(&server).await;

    let outcome = eval(&repl, "1 + 1").await;
    assert_eq!(
        outcome.events,
        vec![
            EvalEvent::Value {
                value: "2".into(),
                ns: Some("user".into())
            },
            EvalEvent::Done {
                status: vec!["done".into()]
            },
        ]
    );
}

#[tokio::test]
async fn test_eval_request_carries_session_and_context() {
    let mut server = FakeServer::spawn().await;
    let repl = connected_with(ReplConfig {
        default_ns: Some("app.core".into()),
        ..config(&server)
    })
    .await;

    let options = EvalOptions {
        file: Some("lib/app.rb".into()),
        line: Some(12),
        ..EvalOptions::default()
    };
    let stream = repl.evaluate("(+ 1 2)", options).unwrap();
    let handle = stream.handle();
    timeout(TEST_TIMEOUT, stream.collect()).await.expect("Test timed out");

    let request = server.expect_op("eval").await;
    assert_eq!(request.id(), Some(handle.id()));
    assert_eq!(request.session(), Some(SERVER_SESSION));
    assert_eq!(request.get_str("ns"), Some("app.core"));
    assert_eq!(request.get_str("file"), Some("lib/app.rb"));
    assert_eq!(request.get("line"), Some(&Value::Int(12)));
    assert_eq!(request.get("column"), None);
}

#[tokio::test]
async fn test_eval_output_is_streamed_before_value() {
    let server = FakeServer::spawn().await;
    let repl = connected(&server).await;

    let outcome = eval(&repl, "(puts \"hello\")").await;
    assert_eq!(outcome.stdout(), "hello\n");
    assert_eq!(outcome.last_value(), Some("nil"));
    assert!(matches!(outcome.events[0], EvalEvent::Stdout { .. }));
    assert!(matches!(outcome.terminal(), Some(EvalEvent::Done { .. })));
}

#[tokio::test]
async fn test_remote_exception_keeps_session_usable() {
    let server = FakeServer::spawn().await;
    let repl = connected(&server).await;

    let outcome = eval(&repl, "(/ 1 0)").await;
    assert_eq!(
        outcome.events,
        vec![
            EvalEvent::Exception {
                ex: "ZeroDivisionError".into(),
                root_ex: Some("ZeroDivisionError".into())
            },
            EvalEvent::Stderr {
                text: "divided by 0\n".into()
            },
            EvalEvent::Done {
                status: vec!["done".into()]
            },
        ]
    );
    assert_eq!(outcome.exception(), Some("ZeroDivisionError"));
    assert_eq!(repl.status(), SessionStatus::Connected);

    let outcome = eval(&repl, "1 + 1").await;
    assert_eq!(outcome.last_value(), Some("2"));
}

#[tokio::test]
async fn test_interrupt_cancels_stream_and_notifies_server() {
    let mut server = FakeServer::spawn().await;
    let repl = connected(&server).await;

    let mut stream = repl.evaluate("(sleep)", EvalOptions::default()).unwrap();
    let handle = stream.handle();
    server.expect_op("eval").await;

    repl.interrupt(&handle).unwrap();
    let event = timeout(TEST_TIMEOUT, stream.next()).await.expect("Test timed out");
    assert_eq!(event, Some(EvalEvent::Cancelled));
    assert_eq!(stream.next().await, None);

    let request = server.expect_op("interrupt").await;
    assert_eq!(request.get_str("interrupt-id"), Some(handle.id()));
    assert_eq!(request.session(), Some(SERVER_SESSION));

    // Interrupting again is a no-op
    repl.interrupt(&handle).unwrap();

    // The server's done for the interrupted request clears the pending entry
    timeout(TEST_TIMEOUT, async {
        while repl.session().pending_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Pending requests were not cleared");
}

#[tokio::test]
async fn test_disconnect_mid_eval_cancels_and_closes_server_session() {
    let mut server = FakeServer::spawn().await;
    let repl = connected(&server).await;

    let stream = repl.evaluate("(sleep)", EvalOptions::default()).unwrap();
    server.expect_op("eval").await;

    repl.disconnect();
    let outcome = timeout(TEST_TIMEOUT, stream.collect())
        .await
        .expect("Test timed out");
    assert_eq!(outcome.events, vec![EvalEvent::Cancelled]);
    assert_eq!(repl.status(), SessionStatus::Disconnected);
    assert_eq!(repl.server_session(), None);

    let close = server.expect_op("close").await;
    assert_eq!(close.session(), Some(SERVER_SESSION));

    repl.disconnect();
    assert!(matches!(
        repl.evaluate("1 + 1", EvalOptions::default()),
        Err(ReplError::Transport(_))
    ));
}

#[tokio::test]
async fn test_completions_and_lookup() {
    let server = FakeServer::spawn().await;
    let repl = connected(&server).await;

    let completions = timeout(TEST_TIMEOUT, repl.completions("ma", None))
        .await
        .expect("Test timed out")
        .unwrap();
    let candidates: Vec<_> = completions.iter().map(|c| c.candidate.as_str()).collect();
    assert_eq!(candidates, vec!["ma-one", "ma-two"]);
    assert_eq!(completions[0].kind.as_deref(), Some("function"));

    let info = timeout(TEST_TIMEOUT, repl.lookup("hello", Some("Person")))
        .await
        .expect("Test timed out")
        .unwrap()
        .expect("hello should be known");
    assert_eq!(info.name, "hello");
    assert_eq!(info.ns.as_deref(), Some("Person"));
    assert_eq!(info.doc.as_deref(), Some("Greets someone"));
    assert_eq!(info.arglists.as_deref(), Some("(greeting)"));
    assert_eq!(info.line, Some(9));

    let missing = timeout(TEST_TIMEOUT, repl.lookup("nope", None))
        .await
        .expect("Test timed out")
        .unwrap();
    assert_eq!(missing, None);
}

#[tokio::test]
async fn test_describe_lists_ops() {
    let server = FakeServer::spawn().await;
    let repl = connected(&server).await;

    let reply = timeout(TEST_TIMEOUT, repl.describe())
        .await
        .expect("Test timed out")
        .unwrap();
    let ops = reply.get("ops").and_then(Value::as_dict).expect("ops dict");
    assert!(ops.contains_key("eval"));
    assert!(ops.contains_key("interrupt"));
}

#[tokio::test]
async fn test_unsupported_op_is_a_remote_error() {
    let server = FakeServer::with_ops(&["clone", "eval", "close"]).await;
    let repl = connected(&server).await;

    let result = timeout(TEST_TIMEOUT, repl.completions("ma", None))
        .await
        .expect("Test timed out");
    match result {
        Err(ReplError::Remote { op, status }) => {
            assert_eq!(op, "completions");
            assert!(status.contains("unknown-op"));
        }
        other => panic!("Expected a remote error, got {:?}", other),
    }

    // Evaluation still works
    assert_eq!(eval(&repl, "1 + 1").await.last_value(), Some("2"));
}

#[tokio::test]
async fn test_load_file_sends_contents() {
    let mut server = FakeServer::spawn().await;
    let repl = connected(&server).await;

    let dir = std::env::temp_dir().join(format!("chlorine-load-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("greeter.rb");
    std::fs::write(&path, "def hello = 'hi'\n").unwrap();

    let stream = repl.load_file(&path).await.unwrap();
    let outcome = timeout(TEST_TIMEOUT, stream.collect())
        .await
        .expect("Test timed out");
    assert_eq!(outcome.last_value(), Some("loaded greeter.rb"));

    let request = server.expect_op("load-file").await;
    assert_eq!(request.get_str("file"), Some("def hello = 'hi'\n"));
    assert_eq!(request.get_str("file-name"), Some("greeter.rb"));

    let missing = repl.load_file(&dir.join("missing.rb")).await;
    assert!(matches!(missing, Err(ReplError::Io(_))));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_connect_refused() {
    // Bind then drop to get a port nobody listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let (repl, _events) = Repl::new(ReplConfig::default());
    let result = timeout(TEST_TIMEOUT, repl.connect("127.0.0.1", port))
        .await
        .expect("Test timed out");
    assert!(matches!(
        result,
        Err(ReplError::Connect(ConnectError::Refused { .. }))
    ));
    assert_eq!(repl.status(), SessionStatus::Disconnected);
}

#[tokio::test]
async fn test_connect_unresolvable_host() {
    let (repl, _events) = Repl::new(ReplConfig::default());
    let result = timeout(
        TEST_TIMEOUT,
        repl.connect_with_timeout("nosuchhost.invalid", 9192, Duration::from_secs(1)),
    )
    .await
    .expect("Test timed out");

    assert!(
        matches!(
            result,
            Err(ReplError::Connect(
                ConnectError::DnsFailure { .. } | ConnectError::Timeout(_)
            ))
        ),
        "unexpected result: {:?}",
        result
    );
    assert_eq!(repl.status(), SessionStatus::Disconnected);
}

#[tokio::test]
async fn test_second_connect_while_connecting_is_rejected() {
    let server = FakeServer::spawn().await;
    let (repl, _events) = Repl::new(config(&server));

    // Name resolution makes the first attempt yield before it completes
    let (first, second) = timeout(TEST_TIMEOUT, async {
        tokio::join!(
            repl.connect("localhost", server.port),
            repl.connect("localhost", server.port)
        )
    })
    .await
    .expect("Test timed out");

    let rejected = |r: &Result<(), ReplError>| {
        matches!(r, Err(ReplError::Connect(ConnectError::InProgress)))
    };
    assert!(
        (first.is_ok() && rejected(&second)) || (rejected(&first) && second.is_ok()),
        "first: {:?}, second: {:?}",
        first,
        second
    );
    assert_eq!(repl.status(), SessionStatus::Connected);
}

#[tokio::test]
async fn test_connect_during_handshake_leaves_first_attempt_alone() {
    let mut server = FakeServer::ignoring(&["clone"]).await;
    let (repl, _events) = Repl::new(config(&server));

    let first = tokio::spawn({
        let repl = repl.clone();
        let port = server.port;
        async move { repl.connect("127.0.0.1", port).await }
    });
    // The first attempt is connected and waiting for its clone reply
    server.expect_op("clone").await;
    assert_eq!(repl.status(), SessionStatus::Connected);

    let second = timeout(TEST_TIMEOUT, repl.connect("127.0.0.1", server.port))
        .await
        .expect("Test timed out");
    assert!(
        matches!(second, Err(ReplError::Connect(ConnectError::InProgress))),
        "second: {:?}",
        second
    );
    assert_eq!(repl.status(), SessionStatus::Connected);
    assert!(!first.is_finished());

    // Disconnecting ends the handshake it interrupted
    repl.disconnect();
    let first = timeout(TEST_TIMEOUT, first)
        .await
        .expect("Test timed out")
        .unwrap();
    assert!(matches!(first, Err(ReplError::Cancelled)), "first: {:?}", first);
    assert_eq!(repl.status(), SessionStatus::Disconnected);
    assert_eq!(repl.server_session(), None);

    // The flag was released
    let retry = timeout(
        TEST_TIMEOUT,
        repl.connect_with_timeout("127.0.0.1", server.port, Duration::from_millis(200)),
    )
    .await
    .expect("Test timed out");
    assert!(
        matches!(retry, Err(ReplError::Connect(ConnectError::Timeout(_)))),
        "retry: {:?}",
        retry
    );
}

#[tokio::test]
async fn test_reconnect_closes_previous_server_session() {
    let mut server = FakeServer::spawn().await;
    let repl = connected(&server).await;
    server.expect_op("clone").await;

    timeout(TEST_TIMEOUT, repl.connect("127.0.0.1", server.port))
        .await
        .expect("Test timed out")
        .expect("Reconnect failed");

    let close = server.expect_op("close").await;
    assert_eq!(close.session(), Some(SERVER_SESSION));
    assert_eq!(repl.status(), SessionStatus::Connected);
    assert_eq!(repl.server_session().as_deref(), Some(SERVER_SESSION));
}
