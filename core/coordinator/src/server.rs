//! Unix socket front end for the coordinator.
//!
//! One newline-terminated JSON request per connection, one JSON response
//! line back. `subscribe` is the exception: after the response the
//! connection stays open and receives one [`StateUpdate`] line per broadcast
//! until the client hangs up.

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use chat_tally_protocol::{
    parse_message, parse_session_params, ErrorInfo, Method, Request, Response, StateUpdate,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

use crate::coordinator::{CoordinatorGone, CoordinatorHandle};

const READ_TIMEOUT_SECS: u64 = 2;

pub fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs_err::create_dir_all(parent)
        .map_err(|err| format!("Failed to create socket directory: {}", err))
}

pub fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs_err::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

/// Accepts connections until `shutdown` resolves.
pub async fn serve(
    listener: UnixListener,
    handle: CoordinatorHandle,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let handle = handle.clone();
                    tokio::spawn(handle_connection(stream, handle));
                }
                Err(err) => warn!(error = %err, "Failed to accept coordinator connection"),
            },
            () = &mut shutdown => {
                info!("Shutdown requested; no longer accepting connections");
                break;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, handle: CoordinatorHandle) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = match read_request(&mut reader).await {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let _ = write_line(&mut write_half, &Response::error_with_info(None, err)).await;
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Coordinator request received");

    // Subscribe before answering so no update between the two is lost.
    let updates = (request.method == Method::Subscribe
        && request.protocol_version == PROTOCOL_VERSION)
        .then(|| handle.subscribe());

    let response = handle_request(request, &handle).await;
    let streaming = response.ok && updates.is_some();
    if write_line(&mut write_half, &response).await.is_err() || !streaming {
        return;
    }

    if let Some(updates) = updates {
        stream_updates(reader, write_half, updates).await;
    }
}

async fn read_request<R>(reader: &mut R) -> Result<Request, ErrorInfo>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut buffer = Vec::new();
    let limit = MAX_REQUEST_BYTES as u64 + 1;
    let read = tokio::time::timeout(
        Duration::from_secs(READ_TIMEOUT_SECS),
        (&mut *reader).take(limit).read_until(b'\n', &mut buffer),
    )
    .await;

    match read {
        Err(_) => return Err(ErrorInfo::new("read_timeout", "request timed out")),
        Ok(Err(err)) => {
            return Err(ErrorInfo::new(
                "read_error",
                format!("failed to read request: {}", err),
            ))
        }
        Ok(Ok(_)) => {}
    }

    if buffer.len() > MAX_REQUEST_BYTES {
        return Err(ErrorInfo::new(
            "request_too_large",
            "request exceeded maximum size",
        ));
    }

    if buffer.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(&buffer).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

pub async fn handle_request(request: Request, handle: &CoordinatorHandle) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => match handle.sessions().await {
            Ok(sessions) => Response::ok(
                request.id,
                serde_json::json!({
                    "status": "ok",
                    "pid": std::process::id(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol_version": PROTOCOL_VERSION,
                    "sessions": sessions.len(),
                }),
            ),
            Err(err) => unavailable(request.id, err),
        },
        Method::Event => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(
                        request.id,
                        "invalid_params",
                        "event payload is required",
                    )
                }
            };
            let message = match parse_message(params) {
                Ok(message) => message,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            debug!(
                session_id = %message.session_id(),
                kind = message.kind(),
                "Received sync message"
            );
            handle.apply(message);
            Response::ok(request.id, serde_json::json!({ "accepted": true }))
        }
        Method::QuerySessionState => {
            let params = match parse_session_params(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match handle.session(params.session_id.as_str()).await {
                Ok(Some(snapshot)) => serialize(request.id, &snapshot, "session"),
                Ok(None) => Response::ok(
                    request.id,
                    serde_json::json!({ "found": false, "session_id": params.session_id }),
                ),
                Err(err) => unavailable(request.id, err),
            }
        }
        Method::QueryGlobalState => match handle.global().await {
            Ok(global) => serialize(request.id, &global, "global state"),
            Err(err) => unavailable(request.id, err),
        },
        Method::ListSessions => match handle.sessions().await {
            Ok(sessions) => {
                debug!(sessions = sessions.len(), "Sessions snapshot");
                serialize(request.id, &sessions, "sessions")
            }
            Err(err) => unavailable(request.id, err),
        },
        Method::EvictSession => {
            let params = match parse_session_params(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match handle.evict(params.session_id.as_str()).await {
                Ok(evicted) => Response::ok(request.id, serde_json::json!({ "evicted": evicted })),
                Err(err) => unavailable(request.id, err),
            }
        }
        Method::SetForeground => {
            let params = match parse_session_params(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            handle.set_foreground(params.session_id.as_str());
            Response::ok(
                request.id,
                serde_json::json!({ "foreground": params.session_id }),
            )
        }
        Method::Subscribe => Response::ok(request.id, serde_json::json!({ "subscribed": true })),
    }
}

fn serialize<T: serde::Serialize>(id: Option<String>, value: &T, what: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}

fn unavailable(id: Option<String>, err: CoordinatorGone) -> Response {
    Response::error(id, "coordinator_unavailable", err.to_string())
}

async fn stream_updates<R, W>(
    mut reader: R,
    mut writer: W,
    mut updates: broadcast::Receiver<StateUpdate>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!("Subscriber connected");
    let mut probe = [0u8; 64];
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    if write_line(&mut writer, &update).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagging; updates skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            read = reader.read(&mut probe) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
    info!("Subscriber disconnected");
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut line = serde_json::to_vec(value).map_err(io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
