//! chlorine - connect to a socket REPL and evaluate code.
//!
//! This is the command-line counterpart of the editor's
//! `connect-socket-repl` command. It connects to an nREPL server, evaluates
//! `--eval` code, a `--load` file, or stdin line by line, and prints the
//! streamed events. Ctrl-C interrupts the running evaluation.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chlorine_nrepl::config::discover_port_file;
use chlorine_nrepl::nrepl::ResponseBody;
use chlorine_nrepl::{EvalEvent, EvalOptions, EvalStream, Repl, ReplConfig, SessionEvent};

#[derive(Debug, Parser)]
#[command(name = "chlorine", version, about = "Evaluate code on a running nREPL server")]
struct Cli {
    /// Server endpoint, e.g. nrepl://127.0.0.1:9192 or localhost:9192
    #[arg(long, conflicts_with_all = ["host", "port"])]
    url: Option<String>,

    /// Server host (default from config, then 127.0.0.1)
    #[arg(long)]
    host: Option<String>,

    /// Server port (default: .nrepl-port, then config, then 9192)
    #[arg(short, long)]
    port: Option<u16>,

    /// Namespace to evaluate in
    #[arg(long)]
    ns: Option<String>,

    /// Connect timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Evaluate this code and exit
    #[arg(short, long, conflicts_with = "load")]
    eval: Option<String>,

    /// Load this file with load-file and exit
    #[arg(short, long)]
    load: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Layer command-line flags over the loaded config.
    fn resolve_config(&self, mut config: ReplConfig) -> Result<ReplConfig> {
        if let Some(url) = &self.url {
            config.set_endpoint(url)?;
        } else {
            if self.port.is_none() {
                if let Some(port) = std::env::current_dir()
                    .ok()
                    .and_then(|cwd| discover_port_file(&cwd))
                {
                    config.port = port;
                }
            }
            if let Some(host) = &self.host {
                config.host = host.clone();
            }
            if let Some(port) = self.port {
                config.port = port;
            }
        }
        if let Some(ms) = self.timeout_ms {
            config.connect_timeout_ms = ms;
        }
        if self.ns.is_some() {
            config.default_ns = self.ns.clone();
        }
        Ok(config)
    }
}

/// How an evaluation ended, for the exit status.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Ok,
    Raised,
    Aborted,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (stderr, so stdout carries only evaluation output)
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chlorine=info,chlorine_nrepl=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.resolve_config(ReplConfig::load()?)?;
    tracing::info!("Starting chlorine v{} ({})", env!("CARGO_PKG_VERSION"), config.endpoint());

    let (repl, mut events) = Repl::new(config.clone());

    // Session-wide events: status changes and server-initiated output
    let json = cli.json;
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} session events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                SessionEvent::Status(status) => tracing::info!("Session {}", status.as_str()),
                SessionEvent::Notification(response) => match response.body {
                    ResponseBody::Out(text) if !json => print!("{}", text),
                    ResponseBody::Err(text) if !json => eprint!("{}", text),
                    other => tracing::debug!("Server notification: {:?}", other),
                },
                SessionEvent::Invalid(reason) => {
                    tracing::warn!("Discarded malformed message: {}", reason)
                }
            }
        }
    });

    repl.connect(&config.host, config.port)
        .await
        .with_context(|| format!("Could not connect to {}", config.endpoint()))?;

    let result = run(&repl, &cli).await;
    repl.disconnect();

    match result? {
        Outcome::Ok => Ok(()),
        Outcome::Raised => anyhow::bail!("Evaluation raised an exception"),
        Outcome::Aborted => anyhow::bail!("Evaluation did not complete"),
    }
}

async fn run(repl: &Repl, cli: &Cli) -> Result<Outcome> {
    if let Some(code) = &cli.eval {
        let stream = repl.evaluate(code, EvalOptions::default())?;
        return drive(repl, stream, cli.json, &mut None).await;
    }

    if let Some(path) = &cli.load {
        let stream = repl
            .load_file(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?;
        return drive(repl, stream, cli.json, &mut None).await;
    }

    // Interactive: one evaluation per stdin line, following ns changes
    let mut current_ns = repl.config().default_ns.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last = Outcome::Ok;

    loop {
        if !cli.json {
            print!("{}=> ", current_ns.as_deref().unwrap_or(""));
            std::io::stdout().flush()?;
        }
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        if !repl.status().is_connected() {
            anyhow::bail!("Connection to the REPL server was lost");
        }

        let options = EvalOptions {
            ns: current_ns.clone(),
            ..EvalOptions::default()
        };
        let stream = repl.evaluate(&line, options)?;
        last = drive(repl, stream, cli.json, &mut current_ns).await?;
    }

    Ok(if last == Outcome::Aborted {
        Outcome::Aborted
    } else {
        Outcome::Ok
    })
}

/// Print an evaluation's events until it ends; Ctrl-C interrupts it.
async fn drive(
    repl: &Repl,
    mut stream: EvalStream,
    json: bool,
    current_ns: &mut Option<String>,
) -> Result<Outcome> {
    let handle = stream.handle();
    let mut outcome = Outcome::Ok;

    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = tokio::signal::ctrl_c() => {
                repl.interrupt(&handle)?;
                continue;
            }
        };
        let Some(event) = event else {
            break;
        };

        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }

        match &event {
            EvalEvent::Value { ns: Some(ns), .. } => *current_ns = Some(ns.clone()),
            EvalEvent::Exception { .. } => outcome = Outcome::Raised,
            EvalEvent::Cancelled | EvalEvent::Failed { .. } => outcome = Outcome::Aborted,
            _ => {}
        }
    }

    std::io::stdout().flush()?;
    Ok(outcome)
}

fn print_event(event: &EvalEvent) {
    match event {
        EvalEvent::Stdout { text } => print!("{}", text),
        EvalEvent::Stderr { text } => eprint!("{}", text),
        EvalEvent::Value { value, .. } => println!("{}", value),
        EvalEvent::Exception { ex, root_ex } => match root_ex {
            Some(root) if root != ex => eprintln!("Exception: {} (caused by {})", ex, root),
            _ => eprintln!("Exception: {}", ex),
        },
        EvalEvent::Done { .. } => {}
        EvalEvent::Cancelled => eprintln!("Interrupted"),
        EvalEvent::Failed { error } => eprintln!("Error: {}", error),
    }
}
