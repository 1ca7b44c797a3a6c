//! WebSocket RPC session implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use tidepool_core::{Connector, Credentials, DriverError, PoolConfig, Session};

use crate::rpc::{RpcErrorBody, RpcRequest, RpcResponse};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type Pending = HashMap<u64, oneshot::Sender<Result<Value, DriverError>>>;

/// One WebSocket RPC session to the database server.
///
/// Internally synchronized: requests may be issued concurrently from behind
/// a shared reference. A background reader task routes responses back to
/// their callers through a pending-request map keyed by frame id.
pub struct WireSession {
    shared: Arc<SessionShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct SessionShared {
    sink: tokio::sync::Mutex<WsSink>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    connected: AtomicBool,
    /// Bound on a single RPC round-trip.
    rpc_timeout: Duration,
    session_id: Uuid,
    endpoint: String,
}

fn lock_pending(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fail every in-flight request. Called when the stream dies or closes.
fn fail_pending(shared: &SessionShared) {
    let drained: Vec<_> = lock_pending(&shared.pending).drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(DriverError::ConnectionClosed));
    }
}

fn dispatch(shared: &SessionShared, text: &str) {
    let response: RpcResponse = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(error) => {
            tracing::warn!(session = %shared.session_id, %error, "unparseable frame");
            return;
        }
    };

    let Some(id) = response.id else {
        tracing::trace!(session = %shared.session_id, "ignoring notification frame");
        return;
    };

    let Some(tx) = lock_pending(&shared.pending).remove(&id) else {
        // Caller gave up (timeout) before the response arrived.
        tracing::trace!(session = %shared.session_id, id, "response without pending request");
        return;
    };

    let outcome = match response.error {
        Some(RpcErrorBody { code, message }) => Err(DriverError::Rpc { code, message }),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };
    let _ = tx.send(outcome);
}

async fn read_loop(shared: Arc<SessionShared>, mut source: WsSource) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => dispatch(&shared, &text),
            Ok(WsMessage::Close(_)) => break,
            // Ping/pong and binary frames carry no RPC payload.
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(session = %shared.session_id, %error, "websocket read failed");
                break;
            }
        }
    }
    shared.connected.store(false, Ordering::Release);
    fail_pending(&shared);
    tracing::debug!(session = %shared.session_id, "reader stopped");
}

impl WireSession {
    /// Open a session to the endpoint described by `config`.
    ///
    /// Bounded by `config.connection_timeout`. Authentication and
    /// namespace selection are separate calls.
    pub async fn connect(config: &PoolConfig) -> Result<Self, DriverError> {
        let url = url::Url::parse(&config.uri)
            .map_err(|e| DriverError::invalid_endpoint(e.to_string()))?;
        match url.scheme() {
            "wss" => {}
            "ws" if !config.tls => {}
            "ws" => {
                return Err(DriverError::invalid_endpoint(
                    "tls is required but the endpoint is ws://",
                ));
            }
            other => {
                return Err(DriverError::invalid_endpoint(format!(
                    "unsupported scheme {other:?}"
                )));
            }
        }

        let (stream, _response) =
            tokio::time::timeout(config.connection_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| DriverError::timeout("connect", config.connection_timeout))?
                .map_err(|e| DriverError::handshake(e.to_string()))?;

        let (sink, source) = stream.split();
        let shared = Arc::new(SessionShared {
            sink: tokio::sync::Mutex::new(sink),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            rpc_timeout: config.connection_timeout,
            session_id: Uuid::new_v4(),
            endpoint: config.uri.clone(),
        });

        let reader = tokio::spawn(read_loop(Arc::clone(&shared), source));
        tracing::info!(session = %shared.session_id, endpoint = %shared.endpoint, "session connected");

        Ok(Self {
            shared,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// The correlation id used in log lines for this session.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, DriverError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(DriverError::NotConnected);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&RpcRequest { id, method, params })?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.shared.pending).insert(id, tx);
        let sent = {
            let mut sink = self.shared.sink.lock().await;
            sink.send(WsMessage::Text(frame)).await
        };
        if let Err(error) = sent {
            lock_pending(&self.shared.pending).remove(&id);
            self.shared.connected.store(false, Ordering::Release);
            return Err(DriverError::connection(format!(
                "failed to send frame: {error}"
            )));
        }

        match tokio::time::timeout(self.shared.rpc_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Reader dropped the sender: the stream died under us.
            Ok(Err(_)) => Err(DriverError::ConnectionClosed),
            Err(_) => {
                lock_pending(&self.shared.pending).remove(&id);
                Err(DriverError::timeout(method, self.shared.rpc_timeout))
            }
        }
    }
}

impl Session for WireSession {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), DriverError> {
        let params = serde_json::to_value(credentials)?;
        match self.request("signin", Value::Array(vec![params])).await {
            Ok(_) => Ok(()),
            // Any application-level failure on signin is a rejection.
            Err(DriverError::Rpc { message, .. }) => {
                Err(DriverError::AuthenticationRejected { message })
            }
            Err(other) => Err(other),
        }
    }

    async fn select(&self, namespace: &str, database: &str) -> Result<(), DriverError> {
        self.request("use", serde_json::json!([namespace, database]))
            .await
            .map(|_| ())
    }

    async fn execute(&self, statement: &str, params: Value) -> Result<Value, DriverError> {
        self.request("query", serde_json::json!([statement, params]))
            .await
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.request("ping", serde_json::json!([])).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.shared.connected.swap(false, Ordering::AcqRel) {
            let mut sink = self.shared.sink.lock().await;
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
            drop(sink);
            tracing::debug!(session = %self.shared.session_id, "session closed");
        }
        if let Some(handle) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        fail_pending(&self.shared);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

impl Drop for WireSession {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for WireSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireSession")
            .field("session_id", &self.shared.session_id)
            .field("endpoint", &self.shared.endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Opens [`WireSession`]s for a pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireConnector;

impl WireConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Connector for WireConnector {
    type Session = WireSession;

    async fn connect(&self, config: &PoolConfig) -> Result<WireSession, DriverError> {
        WireSession::connect(config).await
    }
}
