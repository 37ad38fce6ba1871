//! frame-server demo binary.
//!
//! Routes:
//! - id 0: replies `ping... ping... ping...` on message id 1
//! - id 1: replies a welcome text on message id 1
//!
//! On connect the server pushes message id 202 and stores a couple of
//! properties that are logged again on disconnect.

use async_trait::async_trait;
use frame_server::{Config, Connection, Request, Router, Server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct PingRouter;

#[async_trait]
impl Router for PingRouter {
    async fn handle(&self, request: &Request) {
        info!(
            msg_id = request.msg_id(),
            data = %String::from_utf8_lossy(request.data()),
            "Ping received"
        );

        if let Err(e) = request
            .connection()
            .send_message(1, &b"ping... ping... ping..."[..])
            .await
        {
            warn!(error = %e, "Ping reply failed");
        }
    }
}

struct HelloRouter;

#[async_trait]
impl Router for HelloRouter {
    async fn handle(&self, request: &Request) {
        info!(
            msg_id = request.msg_id(),
            data = %String::from_utf8_lossy(request.data()),
            "Hello received"
        );

        if let Err(e) = request
            .connection()
            .send_message(1, &b"Hello, welcome to frame-server"[..])
            .await
        {
            warn!(error = %e, "Hello reply failed");
        }
    }
}

fn on_connect(conn: &Connection) {
    if let Err(e) = conn.try_send_message(202, &b"connected"[..]) {
        warn!(conn_id = conn.id(), error = %e, "Greeting failed");
    }

    conn.set_property("peer", conn.remote_addr().to_string());
    conn.set_property("client", String::from("frame-client"));
}

fn on_disconnect(conn: &Connection) {
    let peer = conn.property::<String>("peer").ok();
    let client = conn.property::<String>("client").ok();
    info!(
        conn_id = conn.id(),
        peer = ?peer.as_deref(),
        client = ?client.as_deref(),
        "Connection lost"
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let server = Server::new(config);
    server.on_connection_start(on_connect);
    server.on_connection_stop(on_disconnect);
    server.add_route(0, PingRouter)?;
    server.add_route(1, HelloRouter)?;

    server.serve().await?;
    Ok(())
}
