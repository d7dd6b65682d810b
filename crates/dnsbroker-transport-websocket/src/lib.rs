//! WebSocket front end for the DNS broker
//!
//! Serves the tunnel endpoint over axum and adapts each upgraded socket into a
//! [`dnsbroker_transport::ClientStream`] for the session acceptor.
pub mod server;
pub mod stream;

pub use server::{
    ConnectParams, HealthResponse, WsServer, WsServerConfig, WsServerError, DEFAULT_PATH,
};
pub use stream::client_stream;
