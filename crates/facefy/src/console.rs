//! Line-oriented console front end.
//!
//! Reads commands from stdin and prints connection state and detections as
//! they change.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::Local;
use facefy_core::models::{AggregateSnapshot, ConnectionPhase, DetectionEvent};
use facefy_runtime::aggregator::Aggregator;
use tokio::sync::mpsc;

pub const HELP: &str = "\
commands:
  connect                 connect to the saved server
  disconnect              close the connection
  endpoint <host> <port>  save a new server address
  test <host> <port>      save a server address and connect to it
  stream start|stop       start or stop the video stream
  status                  show the current connection state
  help                    show this message
  quit                    exit";

// ── Commands ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    Endpoint { host: String, port: u32 },
    Test { host: String, port: u32 },
    Stream(bool),
    Status,
    Help,
    Quit,
}

fn parse_port(raw: &str) -> Result<u32> {
    raw.parse::<u32>()
        .map_err(|_| anyhow!("port must be a number, got {raw:?}"))
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&head, args)) = words.split_first() else {
        return Ok(None);
    };

    let command = match (head.to_lowercase().as_str(), args) {
        ("connect", []) => Command::Connect,
        ("disconnect", []) => Command::Disconnect,
        ("endpoint", [host, port]) => Command::Endpoint {
            host: host.to_string(),
            port: parse_port(port)?,
        },
        ("test", [host, port]) => Command::Test {
            host: host.to_string(),
            port: parse_port(port)?,
        },
        ("stream", ["start"]) => Command::Stream(true),
        ("stream", ["stop"]) => Command::Stream(false),
        ("status", []) => Command::Status,
        ("help" | "?", []) => Command::Help,
        ("quit" | "exit" | "q", []) => Command::Quit,
        ("endpoint" | "test", _) => bail!("usage: {head} <host> <port>"),
        ("stream", _) => bail!("usage: stream start|stop"),
        _ => bail!("unknown command {line:?}; type 'help'", line = line.trim()),
    };

    Ok(Some(command))
}

// ── Rendering ──────────────────────────────────────────────────────────────────

pub fn render_status(snapshot: &AggregateSnapshot) -> String {
    let mut line = format!("[{}] {}", snapshot.phase, snapshot.endpoint.uri());
    if let Some(at) = snapshot.last_connected_at {
        line.push_str(&format!(
            " since {}",
            at.with_timezone(&Local).format("%H:%M:%S")
        ));
    }
    if let Some(error) = &snapshot.last_error {
        line.push_str(&format!(" ({error})"));
    }
    line
}

pub fn render_detection(event: &DetectionEvent) -> String {
    let faces = match event.face_count {
        1 => "1 face".to_string(),
        n => format!("{n} faces"),
    };
    let frame = match event.frame_bytes() {
        Ok(Some(bytes)) => format!(", frame {} bytes", bytes.len()),
        Ok(None) => String::new(),
        Err(_) => ", unreadable frame".to_string(),
    };
    format!(
        "{} {faces}{frame}",
        event.observed_at.with_timezone(&Local).format("%H:%M:%S")
    )
}

// ── Event loops ────────────────────────────────────────────────────────────────

/// Run one command. Returns `false` when the console should exit.
pub fn execute(aggregator: &Aggregator, command: Command) -> bool {
    match command {
        Command::Connect => aggregator.connect(),
        Command::Disconnect => aggregator.disconnect(),
        Command::Endpoint { host, port } => match aggregator.update_endpoint(&host, port) {
            Ok(endpoint) => println!("saved {endpoint}"),
            Err(e) => eprintln!("{e}"),
        },
        Command::Test { host, port } => {
            if let Err(e) = aggregator.test_connection(&host, port) {
                eprintln!("{e}");
            }
        }
        Command::Stream(start) => {
            let sent = if start {
                aggregator.start_stream()
            } else {
                aggregator.stop_stream()
            };
            if !sent {
                eprintln!("not connected");
            }
        }
        Command::Status => println!("{}", render_status(&aggregator.snapshot())),
        Command::Help => println!("{HELP}"),
        Command::Quit => return false,
    }
    true
}

/// Forward stdin lines from a plain thread. The runtime never owns the
/// blocking read, so shutdown does not wait for the next line.
fn spawn_stdin_reader() -> mpsc::Receiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Read commands from stdin until `quit` or end of input.
pub async fn run(aggregator: Arc<Aggregator>) -> Result<()> {
    run_lines(aggregator, spawn_stdin_reader()).await
}

async fn run_lines(
    aggregator: Arc<Aggregator>,
    mut lines: mpsc::Receiver<std::io::Result<String>>,
) -> Result<()> {
    while let Some(line) = lines.recv().await {
        let line = line?;
        match parse(&line) {
            Ok(Some(command)) => {
                if !execute(&aggregator, command) {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => eprintln!("{e}"),
        }
    }

    Ok(())
}

/// Print state and detection changes; optionally request the stream each
/// time the connection comes up.
pub async fn render_updates(aggregator: Arc<Aggregator>, stream_on_connect: bool) {
    let mut snapshots = aggregator.subscribe();
    let mut detections = aggregator.subscribe_detections();
    let mut previous = ConnectionPhase::default();

    println!("{}", render_status(&snapshots.borrow_and_update()));

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                println!("{}", render_status(&snapshot));

                if stream_on_connect
                    && snapshot.phase == ConnectionPhase::Connected
                    && previous != ConnectionPhase::Connected
                {
                    aggregator.start_stream();
                }
                previous = snapshot.phase;
            }
            changed = detections.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(event) = detections.borrow_and_update().clone() {
                    println!("{}", render_detection(&event));
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
