//! In-process network connecting any number of nodes without sockets. Useful for simulations and
//! tests.

use super::{RequestHandler, Transport};
use crate::{
    error::RpcError,
    message::{Request, Response},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::task;

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    handlers: Arc<Mutex<HashMap<SocketAddr, Arc<dyn RequestHandler>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport reachable at `addr` on this network.
    pub fn transport(&self, addr: SocketAddr) -> MemoryTransport {
        MemoryTransport {
            addr,
            network: self.clone(),
        }
    }

    /// Whether something currently answers requests sent to `addr`.
    pub fn is_bound(&self, addr: &SocketAddr) -> bool {
        self.handlers.lock().unwrap().contains_key(addr)
    }
}

pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_request(&self, to: SocketAddr, request: Request) -> Result<Response, RpcError> {
        // Let other tasks run, as a real network would.
        task::yield_now().await;

        let handler = self.network.handlers.lock().unwrap().get(&to).cloned();

        handler
            .and_then(|handler| handler.handle_request(self.addr, request))
            .ok_or(RpcError::Timeout)
    }

    fn bind(&self, handler: Arc<dyn RequestHandler>) {
        self.network
            .handlers
            .lock()
            .unwrap()
            .insert(self.addr, handler);
    }

    fn unbind(&self) {
        self.network.handlers.lock().unwrap().remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::PingRequest, test};

    struct Echo(crate::contact::Contact);

    impl RequestHandler for Echo {
        fn handle_request(&self, _from: SocketAddr, _request: Request) -> Option<Response> {
            Some(Response::new(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn positive_bound_transport_answers() {
        let network = MemoryNetwork::new();
        let a = network.transport(test::dummy_socket_addr(1));
        let b = network.transport(test::dummy_socket_addr(2));

        let b_contact = test::contact(test::node_id_with_prefix(0xb0), 2);
        b.bind(Arc::new(Echo(b_contact.clone())));
        assert!(network.is_bound(&b.local_addr()));

        let request = Request::Ping(PingRequest {
            sender: test::contact(test::node_id_with_prefix(0xa0), 1),
        });
        let response = a.send_request(b.local_addr(), request).await.unwrap();
        assert_eq!(response.sender.id, b_contact.id);

        b.unbind();
        assert!(!network.is_bound(&b.local_addr()));
    }

    #[tokio::test]
    async fn negative_unknown_address_fails() {
        let network = MemoryNetwork::new();
        let a = network.transport(test::dummy_socket_addr(1));

        let request = Request::Ping(PingRequest {
            sender: test::contact(test::node_id_with_prefix(0xa0), 1),
        });

        assert!(matches!(
            a.send_request(test::dummy_socket_addr(9), request).await,
            Err(RpcError::Timeout)
        ));
    }
}
