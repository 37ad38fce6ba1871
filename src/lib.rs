//! frame-server: a TCP server framework for length-prefixed binary messages.
//!
//! Features:
//! - 8-byte little-endian header framing (`data_len | msg_id | payload`)
//! - Per-message-id routers with pre/handle/post phases
//! - Worker pool with per-connection ordering, or one task per message
//! - Connection registry, per-connection properties and lifecycle hooks
//! - Configuration via CLI arguments or TOML file
//!
//! ```no_run
//! use async_trait::async_trait;
//! use frame_server::{Config, Request, Router, Server};
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl Router for Ping {
//!     async fn handle(&self, request: &Request) {
//!         let _ = request.connection().send_message(0, &b"pong"[..]).await;
//!     }
//! }
//!
//! # async fn run() -> frame_server::Result<()> {
//! let server = Server::new(Config::default());
//! server.add_route(0, Ping)?;
//! server.serve().await
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod conn_manager;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod router;
pub mod server;

pub use codec::{Codec, HEADER_LEN};
pub use config::{Config, ConfigError};
pub use conn_manager::{ConnectionManager, ManagedConnection};
pub use connection::{Connection, Property};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use message::{Message, Request};
pub use router::Router;
pub use server::{ConnectionHook, Server, ServerState};
