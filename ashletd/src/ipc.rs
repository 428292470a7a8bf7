//! Unix-socket accept loop (§4.7). Each connection carries exactly one JSON
//! request and one JSON reply; shape-based dispatch routes it to the
//! completion, context, or config handler.

use std::collections::HashMap;
use std::sync::Arc;

use ashlet_core::engine::Engine;
use ashlet_core::error::ClientErrorCode;
use ashlet_core::protocol::ConfigReply;
use ashlet_core::protocol::ConfigRequest;
use ashlet_core::protocol::ContextReply;
use ashlet_core::protocol::ContextRequest;
use ashlet_core::protocol::ErrorBody;
use ashlet_core::protocol::Request;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// `session_id -> (request_id of the in-flight completion, its cancel token)`.
/// A single mutex, per §5's "Shared resources" note — not sharded per
/// session, since reload already serializes under the same kind of lock.
type SessionTable = Mutex<HashMap<String, (u64, CancellationToken)>>;

pub struct Server {
    engine: Arc<Engine>,
    sessions: SessionTable,
}

impl Server {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Server {
            engine,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub async fn serve(self: Arc<Self>, listener: UnixListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, no longer accepting connections");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        let read = match reader.read_line(&mut line).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(err) => {
                debug!(error = %err, "failed to read request line");
                return;
            }
        };
        let _ = read;

        let Some(reply) = self.dispatch(&line).await else {
            return;
        };
        let Ok(mut bytes) = serde_json::to_vec(&reply) else {
            warn!("failed to serialize reply");
            return;
        };
        bytes.push(b'\n');
        if let Err(err) = writer.write_all(&bytes).await {
            debug!(error = %err, "failed to write reply");
        }
    }

    /// Returns `None` when the request was malformed (logged, connection
    /// closes without a reply) or a completion was cancelled mid-flight.
    async fn dispatch(&self, line: &str) -> Option<Value> {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(err) => {
                debug!(error = %err, "malformed request, dropping connection");
                return None;
            }
        };

        if value.get("type").and_then(Value::as_str) == Some("context") {
            return Some(self.handle_context(value).await);
        }
        if value.get("action").is_some() {
            return Some(self.handle_config(value).await);
        }
        self.handle_completion(value).await
    }

    async fn handle_context(&self, value: Value) -> Value {
        let request: ContextRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(_) => {
                return context_reply_value(false, Some((ClientErrorCode::InvalidRequest, "malformed context request")));
            }
        };
        if request.cwd.is_empty() {
            return context_reply_value(false, Some((ClientErrorCode::InvalidRequest, "cwd must not be empty")));
        }

        let engine = Arc::clone(&self.engine);
        let cwd = request.cwd.clone();
        tokio::spawn(async move {
            engine.warm_context(&cwd).await;
        });
        context_reply_value(true, None)
    }

    async fn handle_config(&self, value: Value) -> Value {
        let request: ConfigRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(_) => return config_error_value(ClientErrorCode::InvalidRequest, "malformed config request"),
        };

        let reply = match request.action.as_str() {
            "get" => ConfigReply {
                config: serde_json::to_value(self.engine.config_snapshot().await).ok(),
                ..Default::default()
            },
            "reload" => {
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move {
                    if let Err(err) = engine.reload().await {
                        warn!(error = %err, "config reload failed");
                    }
                });
                ConfigReply {
                    config: serde_json::to_value(self.engine.config_snapshot().await).ok(),
                    ..Default::default()
                }
            }
            "defaults" => ConfigReply {
                config: serde_json::to_value(ashlet_core::config::Config::defaults()).ok(),
                ..Default::default()
            },
            "default_prompt" => ConfigReply {
                prompt: Some(ashlet_core::orchestrator::default_system_prompt_source().to_string()),
                ..Default::default()
            },
            "validate" => ConfigReply {
                warnings: Some(self.engine.validate().await),
                ..Default::default()
            },
            other => {
                return config_error_value(ClientErrorCode::UnknownAction, format!("unknown config action: {other}"));
            }
        };

        serde_json::to_value(reply).unwrap_or_else(|_| Value::Null)
    }

    /// Cancels any in-flight completion for the same non-empty `session_id`
    /// before starting a new one; unsessioned (`session_id == ""`) requests
    /// are never consulted against the table, per §5's "only the most
    /// recent completion request proceeds" guarantee being scoped to
    /// sessions.
    async fn handle_completion(&self, value: Value) -> Option<Value> {
        let request: Request = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(err) => {
                debug!(error = %err, "malformed completion request, dropping connection");
                return None;
            }
        };

        let cancel = CancellationToken::new();
        if !request.session_id.is_empty() {
            let mut sessions = self.sessions.lock().await;
            if let Some((_, previous)) = sessions.insert(request.session_id.clone(), (request.request_id, cancel.clone())) {
                previous.cancel();
            }
        }

        let response = self.engine.complete(&request, &cancel).await;

        if !request.session_id.is_empty() {
            let mut sessions = self.sessions.lock().await;
            if let Some((current_id, _)) = sessions.get(&request.session_id) {
                if *current_id == request.request_id {
                    sessions.remove(&request.session_id);
                }
            }
        }

        let response = response?;
        serde_json::to_value(response).ok()
    }
}

fn context_reply_value(ok: bool, error: Option<(ClientErrorCode, &str)>) -> Value {
    let reply = ContextReply {
        ok,
        error: error.map(|(code, message)| ErrorBody {
            code: code.as_str().to_string(),
            message: message.to_string(),
        }),
    };
    serde_json::to_value(reply).unwrap_or(Value::Null)
}

fn config_error_value(code: ClientErrorCode, message: impl Into<String>) -> Value {
    let reply = ConfigReply {
        error: Some(ErrorBody {
            code: code.as_str().to_string(),
            message: message.into(),
        }),
        ..Default::default()
    };
    serde_json::to_value(reply).unwrap_or(Value::Null)
}
