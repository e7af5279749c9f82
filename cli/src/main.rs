//! tether CLI - forwards JSON-RPC messages from stdin to a language server.
//!
//! ```text
//! stdin (one JSON object per line) -> Session -> language server
//!                                        |
//!              stdout <- results  <------+------> stderr <- logs
//! ```
//!
//! Objects carrying an `"id"` are sent as requests and their outcome is
//! printed to stdout, tagged with the input id. Everything else is sent as a
//! notification. Server log messages and diagnostics go to the log.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether_config::{EndpointConfig, TetherConfig};
use tether_lsp::{
    CallError, Session, SessionConfig, SessionState, TcpTransport, WebSocketTransport,
};

const USAGE: &str = "usage: tether <language> [--url <ws-url>] [--tcp <addr>] [--config <path>]";

const DEFAULT_URL: &str = "ws://localhost:8080/lsp";

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // stdout carries protocol output only.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    language: Option<String>,
    url: Option<String>,
    tcp: Option<String>,
    config: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run(Args),
    Help,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "--url" => parsed.url = Some(flag_value(&mut args, "--url")?),
            "--tcp" => parsed.tcp = Some(flag_value(&mut args, "--tcp")?),
            "--config" => parsed.config = Some(flag_value(&mut args, "--config")?.into()),
            flag if flag.starts_with('-') => bail!("unknown option '{flag}'\n{USAGE}"),
            language if parsed.language.is_none() => parsed.language = Some(language.to_string()),
            extra => bail!("unexpected argument '{extra}'\n{USAGE}"),
        }
    }

    Ok(Command::Run(parsed))
}

fn flag_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .with_context(|| format!("{flag} needs a value\n{USAGE}"))
}

#[derive(Debug, PartialEq, Eq)]
enum Endpoint {
    WebSocket { url: String, language: String },
    Tcp(String),
}

/// Command line first, then the config file. `--url` on the command line
/// beats a TCP address from the config file.
fn resolve_endpoint(args: &Args, config: Option<&EndpointConfig>) -> Result<Endpoint> {
    if let Some(addr) = &args.tcp {
        return Ok(Endpoint::Tcp(addr.clone()));
    }
    if args.url.is_none()
        && let Some(addr) = config.and_then(|c| c.tcp.clone())
    {
        return Ok(Endpoint::Tcp(addr));
    }

    let url = args
        .url
        .clone()
        .or_else(|| config.and_then(EndpointConfig::resolved_url))
        .unwrap_or_else(|| DEFAULT_URL.to_string());
    let Some(language) = args
        .language
        .clone()
        .or_else(|| config.and_then(|c| c.language.clone()))
    else {
        bail!("a language is required\n{USAGE}");
    };

    Ok(Endpoint::WebSocket { url, language })
}

fn build_session(endpoint: &Endpoint, config: SessionConfig) -> Result<Session> {
    let session = match endpoint {
        Endpoint::Tcp(addr) => Session::new(TcpTransport::new(addr.clone()), config),
        Endpoint::WebSocket { url, language } => {
            let transport = WebSocketTransport::for_language(url, language)?;
            Session::new(transport, config)
        }
    };
    Ok(session)
}

fn register_handlers(session: &Session) {
    session.on_notification("window/logMessage", |params| {
        log_server_message("logMessage", params.as_ref());
    });
    session.on_notification("window/showMessage", |params| {
        log_server_message("showMessage", params.as_ref());
    });
    session.on_notification("textDocument/publishDiagnostics", |params| {
        log_diagnostics(params.as_ref());
    });
    session.on_request("workspace/configuration", |params| async move {
        Ok(configuration_reply(params.as_ref()))
    });
}

/// Log at the level matching the LSP `MessageType`.
fn log_server_message(kind: &str, params: Option<&Value>) {
    let message = params
        .and_then(|p| p.get("message"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    match params.and_then(|p| p.get("type")).and_then(Value::as_i64) {
        Some(1) => tracing::error!(kind, "{message}"),
        Some(2) => tracing::warn!(kind, "{message}"),
        Some(3) => tracing::info!(kind, "{message}"),
        _ => tracing::debug!(kind, "{message}"),
    }
}

fn log_diagnostics(params: Option<&Value>) {
    let Some(params) = params else {
        return;
    };
    let uri = params.get("uri").and_then(Value::as_str).unwrap_or("<unknown>");
    let diagnostics = params
        .get("diagnostics")
        .and_then(Value::as_array)
        .map_or(&[][..], Vec::as_slice);

    tracing::info!(uri, count = diagnostics.len(), "Diagnostics published");
    for diagnostic in diagnostics {
        let line = diagnostic
            .pointer("/range/start/line")
            .and_then(Value::as_u64)
            .map_or(0, |line| line + 1);
        let message = diagnostic
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        tracing::debug!(uri, line, "{message}");
    }
}

/// `workspace/configuration` is answered with `null` for every item.
fn configuration_reply(params: Option<&Value>) -> Value {
    let items = params
        .and_then(|p| p.get("items"))
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    Value::Array(vec![Value::Null; items])
}

#[derive(Debug, PartialEq)]
enum Outgoing {
    Request {
        echo_id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

fn parse_line(line: &str) -> Result<Option<Outgoing>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(line).context("input is not valid JSON")?;
    let Value::Object(mut object) = value else {
        bail!("input must be a JSON object");
    };
    let Some(Value::String(method)) = object.remove("method") else {
        bail!("input needs a string \"method\"");
    };
    let params = object.remove("params");

    Ok(Some(match object.remove("id") {
        Some(echo_id) => Outgoing::Request {
            echo_id,
            method,
            params,
        },
        None => Outgoing::Notification { method, params },
    }))
}

fn reply_json(echo_id: Value, outcome: Result<Value, CallError>) -> Value {
    match outcome {
        Ok(result) => json!({ "id": echo_id, "result": result }),
        Err(CallError::Rpc(error)) => {
            let mut body = json!({ "code": error.code, "message": error.message });
            if let Some(data) = error.data {
                body["data"] = data;
            }
            json!({ "id": echo_id, "error": body })
        }
        Err(other) => json!({ "id": echo_id, "error": { "message": other.to_string() } }),
    }
}

fn send(session: &Session, outgoing: Outgoing, in_flight: &mut JoinSet<()>) {
    match outgoing {
        Outgoing::Notification { method, params } => {
            if let Err(err) = session.notify(method.as_str(), params) {
                tracing::warn!(%method, "Notification not sent: {err}");
            }
        }
        Outgoing::Request {
            echo_id,
            method,
            params,
        } => match session.request(method, params) {
            Ok(pending) => {
                in_flight.spawn(async move {
                    let outcome = pending.await;
                    println!("{}", reply_json(echo_id, outcome));
                });
            }
            Err(err) => println!("{}", reply_json(echo_id, Err(err))),
        },
    }
}

async fn forward_stdin(session: &Session) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state_rx = session.subscribe();
    let mut in_flight = JoinSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match parse_line(&line) {
                    Ok(Some(outgoing)) => send(session, outgoing, &mut in_flight),
                    Ok(None) => {}
                    Err(err) => tracing::warn!("Skipping input line: {err:#}"),
                }
            }
            result = &mut ctrl_c => {
                if let Err(err) = result {
                    tracing::warn!("Ctrl-C listener failed: {err}");
                }
                tracing::info!("Interrupted; shutting down");
                in_flight.abort_all();
                return Ok(());
            }
            _ = state_rx.wait_for(|state| state.is_terminal()) => {
                in_flight.abort_all();
                bail!("lost the connection to the language server");
            }
        }
    }

    // End of input: wait for answers to everything already sent.
    while in_flight.join_next().await.is_some() {}
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = match parse_args(env::args().skip(1))? {
        Command::Run(args) => args,
        Command::Help => {
            println!("{USAGE}");
            return Ok(());
        }
    };

    let config = match &args.config {
        Some(path) => Some(TetherConfig::load_from(path)?),
        None => TetherConfig::load().unwrap_or_else(|err| {
            tracing::warn!("Ignoring config file: {err}");
            None
        }),
    };
    let endpoint = resolve_endpoint(&args, config.as_ref().and_then(|c| c.endpoint.as_ref()))?;
    let session_config = config
        .as_ref()
        .map(TetherConfig::session_config)
        .unwrap_or_default();

    let session = build_session(&endpoint, session_config)?;
    register_handlers(&session);
    session
        .connect()
        .await
        .with_context(|| format!("connecting to {}", session.endpoint()))?;

    let result = forward_stdin(&session).await;
    session.shutdown().await;
    if session.state() != SessionState::Closed {
        tracing::warn!(state = %session.state(), "Session did not close cleanly");
    }
    result
}
