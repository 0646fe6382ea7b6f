//! WebSocket JSON-RPC client, the transport behind a mirror.
//!
//! A background task owns the socket. It reconnects according to the
//! configured [`ReconnectPolicy`](crate::config::ReconnectPolicy) and, after
//! every (re)connect, re-subscribes to all known events before reporting
//! itself ready. Calls made while disconnected fail right away with
//! [`Error::NotConnected`]; nothing is queued for later.
//!
//! Call replies and broadcasts are handed to the transport callbacks on the
//! reader, one frame at a time, so they are observed in wire order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::protocol::{self, Incoming, Request, EVENT_OK, SUBSCRIBE};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::transport::{ClientTransport, NotificationHandler, Payload, Reply};

/// Connection state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet, or reconnecting
    Connecting,
    /// Connected and all subscriptions restored
    Ready,
    /// Gave up or closed; no further attempts
    Closed,
}

/// Where the outcome of an in-flight call goes
enum PendingCall {
    /// An awaiting [`RpcClient::request`]
    Waiter(oneshot::Sender<Result<Payload>>),
    /// A transport reply, run on the reader in wire order
    Callback(Reply),
}

impl PendingCall {
    fn resolve(self, result: Result<Payload>) {
        match self {
            PendingCall::Waiter(tx) => {
                let _ = tx.send(result);
            }
            PendingCall::Callback(reply) => reply(result),
        }
    }
}

struct ClientInner {
    url: Url,
    config: ClientConfig,
    next_id: AtomicU64,
    pending: DashMap<u64, PendingCall>,
    handlers: DashMap<String, Vec<NotificationHandler>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    state: watch::Sender<ConnectionState>,
    runtime: tokio::runtime::Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Reconnecting JSON-RPC client.
///
/// Cloning is cheap. The connection task keeps running until [`close`]
/// is called or the reconnect policy gives up.
///
/// [`close`]: RpcClient::close
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Start connecting in the background and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(url: &str, config: ClientConfig) -> Result<Self> {
        let url = Url::parse(url)?;
        let runtime = tokio::runtime::Handle::try_current()?;
        let inner = Arc::new(ClientInner {
            url,
            config,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            handlers: DashMap::new(),
            outbound: Mutex::new(None),
            state: watch::channel(ConnectionState::Connecting).0,
            runtime,
            task: Mutex::new(None),
        });

        let task = inner.runtime.spawn(run(inner.clone()));
        *inner.task.lock() = Some(task);
        Ok(Self { inner })
    }

    /// Connect and wait until the first connection is ready
    pub async fn connect(url: &str, config: ClientConfig) -> Result<Self> {
        let client = Self::new(url, config)?;
        client.wait_ready().await?;
        Ok(client)
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Wait until the client is ready; fails once it is closed
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let reached = state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|s| *s);
        match reached {
            Ok(ConnectionState::Ready) => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    /// Stop the connection task and fail every pending call
    pub fn close(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner.disconnected();
        self.inner.state.send_replace(ConnectionState::Closed);
    }

    /// Call `method` and wait for its result
    pub async fn request(&self, method: &str, params: Option<Payload>) -> Result<Payload> {
        let (id, rx) = self.inner.send_waiting(method, params)?;
        self.inner.await_response(method, id, rx).await
    }

    /// Call `method` without asking for a response
    pub fn notify(&self, method: &str, params: Option<Payload>) -> Result<()> {
        let request = Request {
            jsonrpc: protocol::VERSION.to_string(),
            method: method.to_string(),
            params,
            id: None,
        };
        self.inner.send_text(serde_json::to_string(&request)?)
    }
}

impl ClientInner {
    fn send_text(&self, text: String) -> Result<()> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(Error::NotConnected)?;
        trace!(frame = %text, "send");
        tx.send(text).map_err(|_| Error::NotConnected)
    }

    /// Write the request now, in call order. On failure the pending entry
    /// is handed back unresolved.
    fn send_request(
        &self,
        method: &str,
        params: Option<Payload>,
        pending: PendingCall,
    ) -> std::result::Result<u64, (Error, PendingCall)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = match serde_json::to_string(&Request::call(id, method, params)) {
            Ok(text) => text,
            Err(e) => return Err((e.into(), pending)),
        };
        self.pending.insert(id, pending);
        if let Err(e) = self.send_text(text) {
            return match self.pending.remove(&id) {
                Some((_, pending)) => Err((e, pending)),
                // already failed by a concurrent disconnect
                None => Ok(id),
            };
        }
        Ok(id)
    }

    fn send_waiting(
        &self,
        method: &str,
        params: Option<Payload>,
    ) -> Result<(u64, oneshot::Receiver<Result<Payload>>)> {
        let (tx, rx) = oneshot::channel();
        let id = self
            .send_request(method, params, PendingCall::Waiter(tx))
            .map_err(|(e, _)| e)?;
        Ok((id, rx))
    }

    /// Fail a callback call that got no answer in time
    fn expire(self: &Arc<Self>, method: String, id: u64) {
        let inner = Arc::downgrade(self);
        let timeout = self.config.call_timeout();
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if let Some((_, pending)) = inner.pending.remove(&id) {
                pending.resolve(Err(Error::Timeout(method)));
            }
        });
    }

    async fn await_response(
        &self,
        method: &str,
        id: u64,
        rx: oneshot::Receiver<Result<Payload>>,
    ) -> Result<Payload> {
        match tokio::time::timeout(self.config.call_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::Timeout(method.to_string()))
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let incoming: Incoming = match serde_json::from_str(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!(error = %e, "unparseable frame from server");
                return;
            }
        };

        match incoming {
            Incoming::Notification(note) => {
                let event = note.notification.clone();
                let handlers = self
                    .handlers
                    .get(&event)
                    .map(|entry| entry.value().clone())
                    .unwrap_or_default();
                let value = note.into_value();
                let gone: Vec<NotificationHandler> = handlers
                    .into_iter()
                    .filter(|handler| !handler(value.clone()))
                    .collect();
                if !gone.is_empty() {
                    if let Some(mut handlers) = self.handlers.get_mut(&event) {
                        handlers.retain(|h| !gone.iter().any(|g| Arc::ptr_eq(g, h)));
                    }
                    debug!(%event, dropped = gone.len(), "removed handlers of dropped receivers");
                }
            }
            Incoming::Response(response) => {
                let Some(id) = response.id else {
                    warn!(error = ?response.error, "server reported an error without id");
                    return;
                };
                // resolved here, before the next frame is read
                match self.pending.remove(&id) {
                    Some((_, pending)) => pending.resolve(response.into_result()),
                    None => debug!(id, "response for an unknown or expired call"),
                }
            }
        }
    }

    /// Re-send `rpc.on` for every known event on a fresh connection
    async fn resubscribe(&self) {
        let events: Vec<String> = self.handlers.iter().map(|entry| entry.key().clone()).collect();
        if events.is_empty() {
            return;
        }
        let params = Some(Payload::from(events));
        let sent = self.send_waiting(SUBSCRIBE, params);
        let result = match sent {
            Ok((id, rx)) => self.await_response(SUBSCRIBE, id, rx).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(answer) => log_subscription_answer(&answer),
            Err(e) => warn!(error = %e, "re-subscribing failed"),
        }
    }

    fn disconnected(&self) {
        self.outbound.lock().take();
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                pending.resolve(Err(Error::ConnectionClosed));
            }
        }
    }

    async fn drive(self: &Arc<Self>, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock() = Some(tx);

        let restore = {
            let inner = self.clone();
            self.runtime.spawn(async move {
                inner.resubscribe().await;
                let ready = inner.state.send_if_modified(|state| {
                    let connecting = *state == ConnectionState::Connecting;
                    if connecting {
                        *state = ConnectionState::Ready;
                    }
                    connecting
                });
                if ready {
                    info!(url = %inner.url, "connected");
                }
            })
        };

        let writer = async {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        };
        let reader = async {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        trace!(frame = %text.as_str(), "recv");
                        self.dispatch(text.as_str());
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "connection error");
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = writer => {}
            _ = reader => {}
        }

        restore.abort();
        self.state.send_if_modified(|state| {
            let changed = *state == ConnectionState::Ready;
            if changed {
                *state = ConnectionState::Connecting;
            }
            changed
        });
        self.disconnected();
        info!(url = %self.url, "disconnected");
    }
}

fn log_subscription_answer(answer: &Payload) {
    if let Payload::Object(events) = answer {
        for (event, status) in events {
            if status.as_str() != Some(EVENT_OK) {
                warn!(%event, %status, "subscription refused");
            }
        }
    }
}

async fn run(inner: Arc<ClientInner>) {
    let policy = inner.config.reconnect_policy.clone();
    let mut failed = 0u32;
    loop {
        match tokio_tungstenite::connect_async(inner.url.as_str()).await {
            Ok((ws, _)) => {
                failed = 0;
                inner.drive(ws).await;
            }
            Err(e) => {
                failed += 1;
                debug!(url = %inner.url, error = %e, attempt = failed, "connect failed");
            }
        }

        if !inner.config.reconnect || !policy.allows(failed) {
            break;
        }
        tokio::time::sleep(policy.delay_for(failed.max(1))).await;
    }

    inner.state.send_replace(ConnectionState::Closed);
    info!(url = %inner.url, "client closed");
}

impl ClientTransport for RpcClient {
    fn subscribe(&self, event: &str, handler: NotificationHandler) {
        let fresh = {
            let mut handlers = self.inner.handlers.entry(event.to_string()).or_default();
            handlers.push(handler);
            handlers.len() == 1
        };
        if !fresh {
            return;
        }

        // Not connected: the next (re)connect subscribes.
        let Ok((id, rx)) = self
            .inner
            .send_waiting(SUBSCRIBE, Some(Payload::from(vec![event.to_string()])))
        else {
            return;
        };
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            match inner.await_response(SUBSCRIBE, id, rx).await {
                Ok(answer) => log_subscription_answer(&answer),
                Err(e) => debug!(error = %e, "subscribe failed"),
            }
        });
    }

    fn call(&self, method: &str, params: Option<Payload>, reply: Reply) {
        match self
            .inner
            .send_request(method, params, PendingCall::Callback(reply))
        {
            Ok(id) => self.inner.expire(method.to_string(), id),
            Err((e, pending)) => {
                // Still asynchronous from the caller's point of view.
                self.inner.runtime.spawn(async move { pending.resolve(Err(e)) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::rpc::RpcServer;
    use crate::value::SyncedValue;
    use std::time::Duration;

    async fn settle(check: impl Fn() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_mirror_handler_is_removed() {
        let server = RpcServer::new(ServerConfig {
            port: 0,
            ..Default::default()
        });
        let authority = SyncedValue::<u32>::authority(server.clone(), "foo");
        let handle = server.listen().await.unwrap();
        let client = RpcClient::connect(&handle.url(), ClientConfig::default())
            .await
            .unwrap();

        let mirror = SyncedValue::<u32>::mirror(client.clone(), "foo");
        let kept = SyncedValue::<u32>::mirror(client.clone(), "foo");
        authority.set_value(1).unwrap();
        assert!(settle(|| mirror.get_value() == Some(1) && kept.get_value() == Some(1)).await);
        assert_eq!(client.inner.handlers.get("foo").map(|h| h.len()), Some(2));

        drop(mirror);
        authority.set_value(2).unwrap();
        assert!(settle(|| kept.get_value() == Some(2)).await);
        assert!(settle(|| client.inner.handlers.get("foo").map(|h| h.len()) == Some(1)).await);

        client.close();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_call_without_connection_replies_later() {
        let client = RpcClient::new("ws://127.0.0.1:9/", ClientConfig::no_reconnect()).unwrap();
        let (tx, rx) = oneshot::channel();
        client.call(
            "get-foo",
            None,
            Box::new(move |r: Result<Payload>| {
                let _ = tx.send(r.is_err());
            }),
        );
        assert!(rx.await.unwrap());
        assert!(client.inner.pending.is_empty());
        client.close();
    }
}
