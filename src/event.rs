use crate::mode::Mode;
use std::net::SocketAddr;

/// Lifecycle events of the DHT, delivered to every subscriber of the manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhtEvent {
    /// A controller of this mode is starting.
    Starting(Mode),
    /// The controller has a working routing table.
    Connected(Mode),
    /// The controller stopped and released its resources.
    Stopped(Mode),
    /// Another live node uses the local id; the controller restarts with a new one.
    Collision(Mode),
}

/// Connectivity changes of the host's Gnutella stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    NoInternet,
    /// A connection to an ultrapeer that runs the DHT was established. Carries the ultrapeer's
    /// DHT address.
    UltrapeerConnected(SocketAddr),
    UltrapeerDisconnected(SocketAddr),
}

/// A DHT-capable host reported by a Gnutella peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhtHost {
    pub addr: SocketAddr,
    pub mode: Mode,
}
