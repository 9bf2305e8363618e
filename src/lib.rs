//! Kademlia DHT embedded in a Gnutella node.
//!
//! The DHT stores alternate locations and push proxies of files keyed by their SHA-1, and runs in
//! one of four modes depending on the node's role in the Gnutella network: not at all, as a full
//! participant, as a firewalled ultrapeer that uses the DHT without being part of its routing
//! tables, or as a leaf relying on its ultrapeers. [`DhtManager`] switches between them.

pub mod transport;

mod bootstrap;
mod builder;
mod compact;
mod config;
mod contact;
mod controller;
mod dht;
mod discovery;
mod error;
mod event;
mod future;
mod host;
mod id;
mod lifo;
mod lookup;
mod manager;
mod message;
mod mode;
mod persist;
mod propagation;
mod routing;
mod socket;
mod storage;
mod time;
mod value;

pub use crate::bootstrap::BootstrapState;
pub use crate::builder::DhtBuilder;
pub use crate::config::{Config, DEFAULT_VENDOR, ROUTE_TABLE_VERSION};
pub use crate::contact::{Contact, ContactState, Vendor, PRIORITY_TIMESTAMP};
pub use crate::controller::ControllerState;
pub use crate::error::{DhtError, PersistError, RpcError};
pub use crate::event::{ConnectionEvent, DhtEvent, DhtHost};
pub use crate::future::DhtFuture;
pub use crate::host::{DiscoveryTarget, GnutellaHost};
pub use crate::id::{Distance, LengthError, NodeId, NODE_ID_BITS, NODE_ID_LEN};
pub use crate::manager::DhtManager;
pub use crate::message::{
    FindNodeRequest, FindValueRequest, PingRequest, Request, Response, StoreRequest,
};
pub use crate::mode::Mode;
pub use crate::routing::TableSettings;
pub use crate::socket::SocketTrait;
pub use crate::storage::PublishPolicy;
pub use crate::transport::{RequestHandler, Transport, UdpTransport};
pub use crate::value::{AltLoc, FirewallInfo, PushProxies, Value, ValueError, ValueType};
