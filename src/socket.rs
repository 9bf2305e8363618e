//! Helpers to simplify work with UdpSocket.

use crate::message::Message;
use async_trait::async_trait;
use std::{io, net::SocketAddr};
use tokio::net::UdpSocket;

// Large enough for a store request carrying several values.
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Datagram socket the UDP transport runs on. Implemented for `tokio::net::UdpSocket`; custom
/// implementations can wrap a socket shared with the rest of the Gnutella stack.
#[async_trait]
pub trait SocketTrait: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

pub(crate) struct Socket(Box<dyn SocketTrait>, SocketAddr);

impl Socket {
    pub fn new<S: SocketTrait>(inner: S) -> io::Result<Self> {
        let inner = Box::new(inner);
        let local_addr = inner.local_addr()?;
        Ok(Self(inner, local_addr))
    }

    pub async fn send(&self, message: &Message, addr: SocketAddr) -> io::Result<()> {
        log::trace!("Sending to {addr:?} {message:?}");
        let bytes = message
            .encode()
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        // Note: if the socket fails to send the entire buffer, then there is no point in trying to
        // send the rest (no node will attempt to reassemble two or more datagrams into a
        // meaningful message).
        self.0.send_to(&bytes, &addr).await?;
        Ok(())
    }

    /// This function is cancel safe: https://docs.rs/tokio/1.12.0/tokio/net/struct.UdpSocket.html#cancel-safety-6
    pub async fn recv(&self, buffer: &mut Vec<u8>) -> io::Result<(Message, SocketAddr)> {
        buffer.resize(MAX_DATAGRAM_SIZE, 0);

        loop {
            let (size, addr) = self.0.recv_from(buffer).await?;
            match Message::decode(&buffer[0..size]) {
                Ok(message) => return Ok((message, addr)),
                Err(error) => {
                    log::warn!("Failed to decode incoming message from {addr:?}: {error}");
                }
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.1
    }
}

#[async_trait]
impl SocketTrait for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, buf, target).await.map(|_| ())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
