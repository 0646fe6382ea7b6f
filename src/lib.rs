//! # ws-value - One Value, One Authority, Many Mirrors
//!
//! Keeps a single named value consistent between an authoritative holder and
//! any number of mirrors connected over a persistent bidirectional channel.
//!
//! ## Features
//!
//! - **Init vs. change**: one-shot init listeners fire on the first present
//!   value, change listeners on every applied update
//! - **Write dedup**: the authority drops writes its equality predicate
//!   considers unchanged, with zero observable side effects
//! - **Passive mirrors**: a mirror write is only a request; the local copy
//!   moves when the authority broadcasts
//! - **Pluggable transport**: any RPC + pub/sub carrier; a JSON-RPC WebSocket
//!   transport and a deterministic in-process loopback are included
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ws_value::{ClientConfig, RpcClient, RpcServer, ServerConfig, SyncedValue};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = RpcServer::new(ServerConfig { port: 0, ..Default::default() });
//!     let handle = server.listen().await?;
//!     let authority = SyncedValue::<u32>::authority(server.clone(), "foo");
//!
//!     let client = RpcClient::connect(&handle.url(), ClientConfig::default()).await?;
//!     let mirror = SyncedValue::<u32>::mirror(client, "foo");
//!     mirror.on_change(|v| println!("mirror now {:?}", v));
//!
//!     authority.set_value(666)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod rpc;
pub mod transport;
pub mod value;

// Re-export main types for library consumers
pub use config::{ClientConfig, Config, ReconnectPolicy, ServerConfig};
pub use error::{Error, Result};
pub use rpc::{RpcClient, RpcServer, ServerHandle};
pub use transport::{ClientTransport, Payload, ServerTransport};
pub use value::{Equality, SyncedValue, ValueHolder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
