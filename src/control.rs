//! The TCP control channel.
//!
//! Newline-delimited UTF-8 requests, one JSON response per request:
//! `{"ok": true, "result": …}` or
//! `{"ok": false, "error": {"kind": …, "message": …}}`. A request is
//! either a bare word with whitespace-separated arguments, or a JSON
//! object `{"command": …, "args": …}`. Each accepted connection gets its
//! own thread; a connection closing never affects the session.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::errors::{RecorderError, Result};
use crate::recorder::{Recorder, Selection};
use crate::source::StreamSource;

pub struct ControlServer {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Binds and starts the accept loop. Port 0 picks an ephemeral port,
    /// which the tests use; [`ControlServer::local_addr`] reports the
    /// actual one.
    pub fn start<S: StreamSource>(
        recorder: Arc<Recorder<S>>,
        bind_address: &str,
        port: u16,
    ) -> std::io::Result<ControlServer> {
        let listener = TcpListener::bind((bind_address, port))?;
        let addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let accept_running = Arc::clone(&running);
        let accept = thread::Builder::new()
            .name("control-accept".into())
            .spawn(move || {
                for connection in listener.incoming() {
                    if !accept_running.load(Ordering::Acquire) {
                        break;
                    }
                    match connection {
                        Ok(stream) => {
                            let recorder = Arc::clone(&recorder);
                            let spawned = thread::Builder::new()
                                .name("control-client".into())
                                .spawn(move || handle_client(&recorder, stream));
                            if let Err(err) = spawned {
                                warn!(%err, "could not spawn control client thread");
                            }
                        }
                        Err(err) => warn!(%err, "accept failed"),
                    }
                }
            })?;
        info!(%addr, "remote control listening");
        Ok(ControlServer {
            addr,
            running,
            accept: Some(accept),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting new connections. Clients already connected keep
    /// their connection until they hang up.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // poke the listener so the accept loop observes the flag
        let _ = TcpStream::connect(self.addr);
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn handle_client<S: StreamSource>(recorder: &Recorder<S>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".into());
    debug!(%peer, "control client connected");

    let reader = match stream.try_clone() {
        Ok(clone) => BufReader::new(clone),
        Err(err) => {
            warn!(%peer, %err, "could not clone control socket");
            return;
        }
    };
    let mut out = stream;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                debug!(%peer, %err, "control read failed");
                break;
            }
        };
        let response = dispatch(recorder, line.trim());
        let mut payload = response.to_string();
        payload.push('\n');
        if out.write_all(payload.as_bytes()).is_err() {
            break;
        }
    }
    debug!(%peer, "control client disconnected");
}

#[derive(Deserialize)]
struct JsonRequest {
    command: String,
    #[serde(default)]
    args: Value,
}

fn dispatch<S: StreamSource>(recorder: &Recorder<S>, line: &str) -> Value {
    let (command, args) = match parse_request(line) {
        Ok(parsed) => parsed,
        Err(err) => return failure(&err),
    };
    debug!(%command, "control command");
    match run_command(recorder, &command, &args) {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(err) => failure(&err),
    }
}

fn failure(err: &RecorderError) -> Value {
    json!({
        "ok": false,
        "error": { "kind": err.kind(), "message": err.to_string() }
    })
}

/// Splits a request line into a command word and its raw argument string.
fn parse_request(line: &str) -> Result<(String, String)> {
    if line.is_empty() {
        return Err(RecorderError::BadRequest("empty request".into()));
    }
    if line.starts_with('{') {
        let request: JsonRequest = serde_json::from_str(line)
            .map_err(|err| RecorderError::BadRequest(format!("malformed JSON request: {err}")))?;
        let args = match request.args {
            Value::Null => String::new(),
            Value::String(text) => text,
            Value::Array(items) => {
                let mut words = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(word) => words.push(word),
                        other => {
                            return Err(RecorderError::BadRequest(format!(
                                "args entries must be strings, got {other}"
                            )))
                        }
                    }
                }
                words.join(" ")
            }
            other => {
                return Err(RecorderError::BadRequest(format!(
                    "args must be a string or an array of strings, got {other}"
                )))
            }
        };
        Ok((request.command.to_ascii_lowercase(), args))
    } else {
        let mut parts = line.splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or("").to_ascii_lowercase();
        let args = parts.next().unwrap_or("").trim().to_string();
        Ok((command, args))
    }
}

fn run_command<S: StreamSource>(
    recorder: &Recorder<S>,
    command: &str,
    args: &str,
) -> Result<Value> {
    match command {
        "status" => to_json(recorder.status()?),
        "streams" => to_json(recorder.stream_list()?),
        "update" => to_json(recorder.update_streams()?),
        "select" => {
            let selection = match args {
                "" => {
                    return Err(RecorderError::BadRequest(
                        "select requires 'all', 'none', or stream uids".into(),
                    ))
                }
                "all" => Selection::All,
                "none" => Selection::None,
                uids => Selection::Uids(uids.split_whitespace().map(str::to_string).collect()),
            };
            to_json(recorder.select(selection)?)
        }
        "start" => {
            recorder.start()?;
            Ok(json!({ "recording": true }))
        }
        "stop" => {
            recorder.stop()?;
            Ok(json!({ "recording": false }))
        }
        "filename" => {
            if args.is_empty() {
                return Err(RecorderError::BadRequest("no filename specified".into()));
            }
            let path = recorder.set_filename(args)?;
            Ok(json!(path.display().to_string()))
        }
        "get_filename" => Ok(recorder
            .filename()?
            .map(|path| json!(path.display().to_string()))
            .unwrap_or(Value::Null)),
        other => Err(RecorderError::BadRequest(format!(
            "unknown command: {other}"
        ))),
    }
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|err| RecorderError::BadRequest(format!("unserializable result: {err}")))
}
