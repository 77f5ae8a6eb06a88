//! Blocking client for the coordinator socket.
//!
//! One request per connection, newline-delimited JSON both ways. The
//! coordinator is the only writer; a failed send is reported to the caller
//! and nothing is queued locally.

use chat_tally_protocol::{
    GlobalAggregate, Method, Request, Response, SessionSnapshot, StateUpdate, SyncMessage,
    MAX_RESPONSE_BYTES,
};
use chrono::Utc;
use rand::RngCore;
use serde_json::{json, Value};
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use tally_core::TallyConfig;

pub const SOCKET_ENV: &str = "CHAT_TALLY_SOCKET";
const READ_TIMEOUT_MS: u64 = 1000;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not reach coordinator at {path}: {source}")]
    Unreachable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("coordinator rejected request: {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("{0}")]
    Transport(String),
}

impl ClientError {
    /// Worth another try: the coordinator may simply not have answered yet.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ClientError::Rejected { .. })
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// `CHAT_TALLY_SOCKET` wins over the configured path.
pub fn resolve_socket(
    env_override: Option<String>,
    config: &TallyConfig,
) -> Result<PathBuf, String> {
    match env_override.filter(|path| !path.trim().is_empty()) {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(config.socket_path()?),
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    socket: PathBuf,
}

impl CoordinatorClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn from_config(config: &TallyConfig) -> Result<Self, String> {
        resolve_socket(env::var(SOCKET_ENV).ok(), config).map(Self::new)
    }

    pub fn health(&self) -> ClientResult<Value> {
        self.call(Method::GetHealth, None)
    }

    pub fn global(&self) -> ClientResult<GlobalAggregate> {
        decode(self.call(Method::QueryGlobalState, None)?)
    }

    /// `None` when the coordinator has no such session.
    pub fn session(&self, session_id: &str) -> ClientResult<Option<SessionSnapshot>> {
        let data = self.call(
            Method::QuerySessionState,
            Some(json!({ "session_id": session_id })),
        )?;
        if data.get("found").and_then(Value::as_bool) == Some(false) {
            return Ok(None);
        }
        decode(data).map(Some)
    }

    pub fn sessions(&self) -> ClientResult<Vec<SessionSnapshot>> {
        decode(self.call(Method::ListSessions, None)?)
    }

    pub fn evict(&self, session_id: &str) -> ClientResult<bool> {
        let data = self.call(
            Method::EvictSession,
            Some(json!({ "session_id": session_id })),
        )?;
        Ok(data.get("evicted").and_then(Value::as_bool).unwrap_or(false))
    }

    pub fn set_foreground(&self, session_id: &str) -> ClientResult<()> {
        self.call(
            Method::SetForeground,
            Some(json!({ "session_id": session_id })),
        )
        .map(|_| ())
    }

    pub fn send_message(&self, message: &SyncMessage) -> ClientResult<()> {
        let params = serde_json::to_value(message).map_err(|err| {
            ClientError::Transport(format!("Failed to serialize message: {}", err))
        })?;
        self.call(Method::Event, Some(params)).map(|_| ())
    }

    /// Sends once, and once more after a short pause if the first try failed
    /// in transit. A rejected message is never resent.
    pub fn send_message_with_retry(&self, message: &SyncMessage) -> ClientResult<()> {
        match self.send_message(message) {
            Ok(()) => Ok(()),
            Err(err) if !err.is_transient() => Err(err),
            Err(err) => {
                tracing::debug!(
                    error = %err,
                    kind = message.kind(),
                    "Failed to send sync message; retrying"
                );
                std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                self.send_message(message)
            }
        }
    }

    /// Opens a subscription. The connection stays open and yields one update
    /// per coordinator mutation until either side hangs up.
    pub fn subscribe(&self) -> ClientResult<Subscription> {
        let mut stream = self.connect()?;
        let request = Request::new(Method::Subscribe, Some(make_request_id()), None);
        write_request(&mut stream, &request)?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|err| ClientError::Transport(format!("Failed to read response: {}", err)))?;
        let response: Response = serde_json::from_str(line.trim_end()).map_err(|err| {
            ClientError::Transport(format!("Failed to parse response JSON: {}", err))
        })?;
        response_data(response)?;

        // Updates arrive whenever something changes; wait as long as needed.
        let _ = reader.get_ref().set_read_timeout(None);
        Ok(Subscription { reader })
    }

    fn call(&self, method: Method, params: Option<Value>) -> ClientResult<Value> {
        let request = Request::new(method, Some(make_request_id()), params);
        response_data(self.send_request(&request)?)
    }

    fn connect(&self) -> ClientResult<UnixStream> {
        let stream = UnixStream::connect(&self.socket).map_err(|source| ClientError::Unreachable {
            path: self.socket.clone(),
            source,
        })?;
        let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
        Ok(stream)
    }

    fn send_request(&self, request: &Request) -> ClientResult<Response> {
        let mut stream = self.connect()?;
        write_request(&mut stream, request)?;
        read_response(&mut stream).map_err(ClientError::Transport)
    }
}

/// Live update stream from [`CoordinatorClient::subscribe`].
pub struct Subscription {
    reader: BufReader<UnixStream>,
}

impl Iterator for Subscription {
    type Item = ClientResult<StateUpdate>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) if line.trim().is_empty() => continue,
                Ok(_) => {
                    return Some(serde_json::from_str(line.trim_end()).map_err(|err| {
                        ClientError::Transport(format!("Failed to parse update: {}", err))
                    }))
                }
                Err(err) => {
                    return Some(Err(ClientError::Transport(format!(
                        "Failed to read update: {}",
                        err
                    ))))
                }
            }
        }
    }
}

fn write_request(stream: &mut UnixStream, request: &Request) -> ClientResult<()> {
    serde_json::to_writer(&mut *stream, request)
        .map_err(|err| ClientError::Transport(format!("Failed to write request: {}", err)))?;
    stream
        .write_all(b"\n")
        .map_err(|err| ClientError::Transport(format!("Failed to flush request: {}", err)))?;
    stream.flush().ok();
    Ok(())
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_RESPONSE_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err("Timed out waiting for coordinator response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Coordinator response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

fn response_data(response: Response) -> ClientResult<Value> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    Err(match response.error {
        Some(error) => ClientError::Rejected {
            code: error.code,
            message: error.message,
        },
        None => ClientError::Rejected {
            code: "unknown".to_string(),
            message: "Unknown coordinator error".to_string(),
        },
    })
}

fn decode<T: serde::de::DeserializeOwned>(data: Value) -> ClientResult<T> {
    serde_json::from_value(data)
        .map_err(|err| ClientError::Transport(format!("Unexpected response shape: {}", err)))
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "req-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        random.next_u64()
    )
}
