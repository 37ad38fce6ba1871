//! Handler extension point.
//!
//! A router is bound to one message id. Every dispatched request runs
//! through three phases in order: `pre_handle`, `handle`, `post_handle`.
//! Only `handle` is required.
//!
//! ```no_run
//! use async_trait::async_trait;
//! use frame_server::{Request, Router};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Router for Echo {
//!     async fn handle(&self, request: &Request) {
//!         let _ = request
//!             .connection()
//!             .send_message(request.msg_id(), request.data().clone())
//!             .await;
//!     }
//! }
//! ```

use crate::message::Request;
use async_trait::async_trait;

/// Business logic for one message id.
#[async_trait]
pub trait Router: Send + Sync + 'static {
    /// Runs before [`handle`](Router::handle). No-op by default.
    async fn pre_handle(&self, _request: &Request) {}

    async fn handle(&self, request: &Request);

    /// Runs after [`handle`](Router::handle). No-op by default.
    async fn post_handle(&self, _request: &Request) {}
}
