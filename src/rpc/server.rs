//! WebSocket JSON-RPC server, the transport behind an authoritative value.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Map;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::protocol::{
    self, Notification, Request, Response, EVENT_INVALID, EVENT_OK, SUBSCRIBE, UNSUBSCRIBE,
};
use crate::config::ServerConfig;
use crate::error::{codes, Error, Result};
use crate::transport::{Payload, Procedure, ServerTransport};

struct ServerInner {
    config: ServerConfig,
    methods: DashMap<String, Procedure>,
    events: DashMap<String, broadcast::Sender<Payload>>,
    /// Never signalled: shutdown source for connections served by `router()`
    detached: watch::Sender<bool>,
}

/// Registry of procedures and events, served over WebSocket connections.
///
/// Cloning is cheap; every clone shares the same registry.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

#[derive(Clone)]
struct ConnState {
    inner: Arc<ServerInner>,
    shutdown: watch::Receiver<bool>,
}

impl RpcServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                methods: DashMap::new(),
                events: DashMap::new(),
                detached: watch::channel(false).0,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Whether an event with this name has been declared
    pub fn has_event(&self, event: &str) -> bool {
        self.inner.events.contains_key(event)
    }

    /// Number of live subscriptions to `event`, across all connections
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.inner
            .events
            .get(event)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Router with the WebSocket endpoint at `/`.
    ///
    /// Connections opened through this router are only closed by their peer.
    pub fn router(&self) -> Router {
        self.router_with(self.inner.detached.subscribe())
    }

    fn router_with(&self, shutdown: watch::Receiver<bool>) -> Router {
        let state = ConnState {
            inner: self.inner.clone(),
            shutdown,
        };
        Router::new()
            .route("/", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until the handle is shut down
    pub async fn listen(&self) -> Result<ServerHandle> {
        let listener = tokio::net::TcpListener::bind(self.inner.config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = self.router_with(shutdown_rx.clone());

        let mut signal = shutdown_rx;
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = signal.changed().await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "server stopped with an error");
            }
        });

        info!(%local_addr, "rpc server listening");
        Ok(ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

impl ServerTransport for RpcServer {
    fn declare_event(&self, event: &str) {
        self.inner
            .events
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.config.event_capacity.max(1)).0);
    }

    fn register(&self, method: &str, procedure: Procedure) {
        self.inner.methods.insert(method.to_string(), procedure);
    }

    fn emit(&self, event: &str, payload: Payload) {
        match self.inner.events.get(event) {
            // no receivers is not an error: nobody is listening yet
            Some(sender) => {
                let _ = sender.send(payload);
            }
            None => debug!(%event, "emit on undeclared event dropped"),
        }
    }
}

/// A running server. Dropping the handle stops it as well.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL of the endpoint
    pub fn url(&self) -> String {
        format!("ws://{}/", self.local_addr)
    }

    /// Stop accepting connections and close every open one
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
        info!(local_addr = %self.local_addr, "rpc server stopped");
    }
}

async fn ws_handler(
    State(state): State<ConnState>,
    ws: WebSocketUpgrade,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: ConnState, socket: WebSocket) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let mut shutdown = state.shutdown.clone();
    if *shutdown.borrow() {
        return;
    }
    debug!(%conn_id, "client connected");

    let send_task = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    trace!(%conn_id, frame = %text.as_str(), "recv");
                    handle_text(&state.inner, text.as_str(), &out_tx, &mut subscriptions);
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(%conn_id, "binary frames are not supported");
                    send(&out_tx, &Response::failure(None, codes::INVALID_REQUEST, "Invalid Request"));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%conn_id, error = %e, "connection error");
                    break;
                }
            }
        }
    }

    for (_, forwarder) in subscriptions {
        forwarder.abort();
    }
    send_task.abort();
    debug!(%conn_id, "client disconnected");
}

fn handle_text(
    inner: &Arc<ServerInner>,
    text: &str,
    out: &mpsc::UnboundedSender<String>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
) {
    let request: Request = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "unparseable request");
            send(out, &Response::parse_error());
            return;
        }
    };

    let result = match request.method.as_str() {
        SUBSCRIBE => subscribe(inner, request.params, out, subscriptions),
        UNSUBSCRIBE => unsubscribe(request.params, subscriptions),
        method => {
            let procedure = inner.methods.get(method).map(|entry| entry.value().clone());
            // The map guard is released before the procedure runs: it may
            // emit, or register further procedures.
            match procedure {
                Some(procedure) => procedure(request.params),
                None => Err(Error::MethodNotFound(method.to_string())),
            }
        }
    };

    match request.id {
        Some(id) => send(out, &Response::from_result(id, result)),
        None => {
            if let Err(e) = result {
                debug!(method = %request.method, error = %e, "fire-and-forget request failed");
            }
        }
    }
}

fn subscribe(
    inner: &Arc<ServerInner>,
    params: Option<Payload>,
    out: &mpsc::UnboundedSender<String>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
) -> Result<Payload> {
    let mut answer = Map::new();
    for event in protocol::event_names(params)? {
        let Some(sender) = inner.events.get(&event).map(|entry| entry.value().clone()) else {
            answer.insert(event, Payload::from(EVENT_INVALID));
            continue;
        };
        if !subscriptions.contains_key(&event) {
            let forwarder = forward(event.clone(), sender.subscribe(), out.clone());
            subscriptions.insert(event.clone(), forwarder);
        }
        answer.insert(event, Payload::from(EVENT_OK));
    }
    Ok(Payload::Object(answer))
}

fn unsubscribe(
    params: Option<Payload>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
) -> Result<Payload> {
    let mut answer = Map::new();
    for event in protocol::event_names(params)? {
        match subscriptions.remove(&event) {
            Some(forwarder) => {
                forwarder.abort();
                answer.insert(event, Payload::from(EVENT_OK));
            }
            None => {
                answer.insert(event, Payload::from(EVENT_INVALID));
            }
        }
    }
    Ok(Payload::Object(answer))
}

/// Relay one event's broadcasts to one connection
fn forward(
    event: String,
    mut rx: broadcast::Receiver<Payload>,
    out: mpsc::UnboundedSender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(value) => {
                    let note = Notification::new(event.clone(), value);
                    match serde_json::to_string(&note) {
                        Ok(text) => {
                            if out.send(text).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(%event, error = %e, "cannot encode broadcast"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%event, skipped, "subscriber lagged, broadcasts dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn send<M: serde::Serialize>(out: &mpsc::UnboundedSender<String>, message: &M) {
    match serde_json::to_string(message) {
        Ok(text) => {
            let _ = out.send(text);
        }
        Err(e) => warn!(error = %e, "cannot encode response"),
    }
}
