//! Reference worker for procpool.
//!
//! Reads framed JSON requests from stdin and answers on stdout, one request
//! at a time. Used by the integration tests and handy for manual experiments.
//!
//! # Commands
//!
//! - `ping` - `{"pong": true, "worker_id": ...}`
//! - `echo` - returns its arguments
//! - `sleep {"ms": n}` - answers after `n` milliseconds
//! - `fail {"message": s}` - answers with `success: false`
//! - `crash {"code": n}` - exits immediately without answering
//! - `pid` - `{"pid": ...}`
//! - `cwd` - `{"cwd": ...}`
//! - `shutdown` - acknowledges, then exits

use std::time::Duration;

use clap::Parser;
use futures::SinkExt;
use procpool_core::protocol::{self, Framing, MessageCodec, ProtocolError, Request, Response};
use serde_json::{json, Map, Value};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line options.
#[derive(Debug, Parser)]
#[command(name = "echo-worker", about = "Reference procpool worker")]
struct Args {
    /// Identity assigned by the pool.
    #[arg(long)]
    worker_id: Option<String>,

    /// Frame delimiter.
    #[arg(long, env = "PROCPOOL_FRAMING", default_value = "newline")]
    framing: Framing,

    /// Largest accepted frame in bytes.
    #[arg(long, default_value_t = protocol::DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// Delay before reading the first request.
    #[arg(long, default_value_t = 0)]
    startup_delay_ms: u64,

    /// Answer `ping` with a failure.
    #[arg(long)]
    reject_ping: bool,
}

enum Action {
    Reply(Response),
    ReplyAndExit(Response),
    Exit(i32),
}

fn handle(args: &Args, request: Request) -> Action {
    let Request {
        id, command, args: params, ..
    } = request;
    match command.as_str() {
        "ping" if args.reject_ping => Action::Reply(Response::err(id, "not ready")),
        "ping" => {
            let mut result = Map::new();
            result.insert("pong".to_string(), json!(true));
            result.insert("worker_id".to_string(), json!(args.worker_id));
            Action::Reply(Response::ok(id, result))
        }
        "echo" => Action::Reply(Response::ok(id, params)),
        "pid" => {
            let mut result = Map::new();
            result.insert("pid".to_string(), json!(std::process::id()));
            Action::Reply(Response::ok(id, result))
        }
        "cwd" => {
            let mut result = Map::new();
            let cwd = std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            result.insert("cwd".to_string(), json!(cwd));
            Action::Reply(Response::ok(id, result))
        }
        "fail" => {
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure");
            Action::Reply(Response::err(id, message))
        }
        "crash" => {
            let code = params.get("code").and_then(Value::as_i64).unwrap_or(1);
            Action::Exit(i32::try_from(code).unwrap_or(1))
        }
        "shutdown" => Action::ReplyAndExit(Response::ok(id, Map::new())),
        other => Action::Reply(Response::err(id, format!("unknown command: {other}"))),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let codec = MessageCodec::new(args.framing, args.max_message_size);
    let mut reader = FramedRead::new(tokio::io::stdin(), codec.clone());
    let mut writer = FramedWrite::new(tokio::io::stdout(), codec);

    if args.startup_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }
    info!(worker_id = ?args.worker_id, framing = %args.framing, "Worker ready");

    loop {
        let request = match protocol::read_message::<_, Request>(&mut reader).await {
            Ok(request) => request,
            Err(ProtocolError::Closed) => {
                debug!("Input closed; exiting");
                return Ok(());
            }
            Err(e @ ProtocolError::Malformed { .. }) => {
                warn!(error = %e, "Skipping malformed request");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if request.command == "sleep" {
            let ms = request.args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let mut result = Map::new();
            result.insert("slept_ms".to_string(), json!(ms));
            writer.send(&Response::ok(request.id, result)).await?;
            continue;
        }

        match handle(&args, request) {
            Action::Reply(response) => writer.send(&response).await?,
            Action::ReplyAndExit(response) => {
                writer.send(&response).await?;
                return Ok(());
            }
            Action::Exit(code) => std::process::exit(code),
        }
    }
}
