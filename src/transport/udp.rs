use super::{RequestHandler, Transport};
use crate::{
    error::RpcError,
    message::{Message, MessageBody, RemoteError, Request, Response},
    socket::{Socket, SocketTrait},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    sync::oneshot,
    task::{self, JoinHandle},
};

type PendingResponse = oneshot::Sender<Result<Response, RpcError>>;

/// Transport over a datagram socket, using bencoded messages matched by transaction id.
pub struct UdpTransport {
    inner: Arc<Inner>,
    worker: JoinHandle<()>,
}

struct Inner {
    socket: Socket,
    pending: Mutex<HashMap<Vec<u8>, PendingResponse>>,
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    next_transaction_id: AtomicU32,
}

impl UdpTransport {
    /// Wrap the socket and start receiving on it. Must be called within a tokio runtime. Fails
    /// only if `socket.local_addr()` fails.
    pub fn new<S: SocketTrait>(socket: S) -> io::Result<Self> {
        let inner = Arc::new(Inner {
            socket: Socket::new(socket)?,
            pending: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            next_transaction_id: AtomicU32::new(rand::random()),
        });

        let worker = task::spawn(receive(inner.clone()));

        Ok(Self { inner, worker })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.socket.local_addr()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_request(&self, to: SocketAddr, request: Request) -> Result<Response, RpcError> {
        let transaction_id = self
            .inner
            .next_transaction_id
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
            .to_vec();

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(transaction_id.clone(), tx);

        // Forget the transaction when the caller gives up waiting.
        let _guard = PendingGuard {
            inner: &self.inner,
            transaction_id: transaction_id.clone(),
        };

        let message = Message {
            transaction_id,
            body: MessageBody::Request(request),
        };

        self.inner.socket.send(&message, to).await?;

        rx.await.map_err(|_| RpcError::Cancelled)?
    }

    fn bind(&self, handler: Arc<dyn RequestHandler>) {
        *self.inner.handler.lock().unwrap() = Some(handler);
    }

    fn unbind(&self) {
        self.inner.handler.lock().unwrap().take();
    }
}

struct PendingGuard<'a> {
    inner: &'a Inner,
    transaction_id: Vec<u8>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner
            .pending
            .lock()
            .unwrap()
            .remove(&self.transaction_id);
    }
}

async fn receive(inner: Arc<Inner>) {
    let mut buffer = Vec::new();

    loop {
        let (message, from) = match inner.socket.recv(&mut buffer).await {
            Ok(received) => received,
            Err(error) => {
                log::warn!("Failed to receive on {}: {}", inner.socket.local_addr(), error);
                continue;
            }
        };

        match message.body {
            MessageBody::Request(request) => {
                let handler = inner.handler.lock().unwrap().clone();
                let handler = match handler {
                    Some(handler) => handler,
                    None => {
                        log::trace!("Dropping request from {from}: transport not bound");
                        continue;
                    }
                };

                if let Some(response) = handler.handle_request(from, request) {
                    let reply = Message {
                        transaction_id: message.transaction_id,
                        body: MessageBody::Response { response },
                    };

                    if let Err(error) = inner.socket.send(&reply, from).await {
                        log::debug!("Failed to answer {from}: {error}");
                    }
                }
            }
            MessageBody::Response { response } => {
                resolve(&inner, &message.transaction_id, from, Ok(response));
            }
            MessageBody::Error {
                error: RemoteError(code, text),
            } => {
                let error = RpcError::Remote {
                    code,
                    message: text,
                };
                resolve(&inner, &message.transaction_id, from, Err(error));
            }
        }
    }
}

fn resolve(
    inner: &Inner,
    transaction_id: &[u8],
    from: SocketAddr,
    result: Result<Response, RpcError>,
) {
    let tx = inner.pending.lock().unwrap().remove(transaction_id);

    match tx {
        Some(tx) => {
            tx.send(result).ok();
        }
        None => log::trace!("Unsolicited response from {from}"),
    }
}
