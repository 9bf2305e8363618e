//! Request/response exchange between DHT nodes.
//!
//! The engine only needs to send a request and await the matching response, and to have incoming
//! requests dispatched to a handler. [`UdpTransport`] does this over a datagram socket and
//! [`memory::MemoryNetwork`] connects nodes living in the same process.

pub mod memory;
mod udp;

pub use self::udp::UdpTransport;

use crate::{
    error::RpcError,
    message::{Request, Response},
};
use async_trait::async_trait;
use std::{net::SocketAddr, sync::Arc};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a request and wait for the response. Does not time out on its own; callers bound
    /// the wait.
    async fn send_request(&self, to: SocketAddr, request: Request) -> Result<Response, RpcError>;

    /// Start dispatching incoming requests to `handler`, replacing any previous one.
    fn bind(&self, handler: Arc<dyn RequestHandler>);

    /// Stop dispatching incoming requests. They are silently dropped afterwards.
    fn unbind(&self);
}

pub trait RequestHandler: Send + Sync + 'static {
    /// Handle a request received from `from`. Returning `None` leaves it unanswered.
    fn handle_request(&self, from: SocketAddr, request: Request) -> Option<Response>;
}
