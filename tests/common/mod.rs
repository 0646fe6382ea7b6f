#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;
use ws_value::{RpcServer, ServerConfig, ServerHandle, SyncedValue};

pub type Seen<T> = Arc<Mutex<Vec<Option<T>>>>;

/// Server on a free local port
pub async fn start_server() -> (RpcServer, ServerHandle) {
    let server = RpcServer::new(ServerConfig {
        port: 0,
        ..Default::default()
    });
    let handle = server.listen().await.expect("listen");
    (server, handle)
}

/// Poll `check` until it holds or `timeout` runs out
pub async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Record every change notification of `value`
pub fn record<T>(value: &SyncedValue<T>) -> Seen<T>
where
    T: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    let seen: Seen<T> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    value.on_change(move |v| sink.lock().push(v.cloned()));
    seen
}

pub const WAIT: Duration = Duration::from_secs(3);
