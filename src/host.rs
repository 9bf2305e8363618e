use crate::{contact::Contact, mode::Mode};
use std::net::SocketAddr;

/// Who to ask for DHT hosts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryTarget {
    /// Every connected Gnutella peer.
    Connected,
    /// A single host, typically one that just advertised DHT support.
    Host(SocketAddr),
}

/// The surrounding Gnutella node, as seen from the DHT.
///
/// Calls are made from the DHT's tasks and must not block.
pub trait GnutellaHost: Send + Sync + 'static {
    /// Externally visible address of the DHT socket, once known.
    fn external_address(&self) -> Option<SocketAddr>;

    /// Whether the host has working Gnutella connections.
    fn is_connected(&self) -> bool;

    fn is_ultrapeer(&self) -> bool;

    /// Ask Gnutella peers for the addresses of DHT nodes they know. Answers come back through
    /// [`DhtManager::handle_dht_hosts`](crate::DhtManager::handle_dht_hosts).
    fn send_dht_hosts_request(&self, target: DiscoveryTarget);

    /// Connected leaves that run a passive DHT and rely on this host as push proxy.
    fn push_proxy_leaves(&self) -> Vec<SocketAddr>;

    /// Deliver a batch of DHT contacts to a leaf.
    fn send_contacts(&self, leaf: SocketAddr, contacts: &[Contact]);

    /// The DHT mode advertised to peers has changed.
    fn capabilities_changed(&self, mode: Mode);
}
