//! JSON-RPC 2.0 over WebSocket.
//!
//! [`RpcServer`] implements [`ServerTransport`](crate::transport::ServerTransport)
//! for the authority and [`RpcClient`] implements
//! [`ClientTransport`](crate::transport::ClientTransport) for mirrors. The
//! frame format follows the `rpc-websockets` conventions, so either side can
//! talk to peers built on that library.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ConnectionState, RpcClient};
pub use server::{RpcServer, ServerHandle};
