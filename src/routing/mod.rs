//! Kademlia routing table: buckets of contacts indexed by how many leading bits they share with
//! the local id.

pub mod bucket;
mod classful;
pub mod table;

pub use self::bucket::Bucket;
pub use self::table::{AddOutcome, RouteTableEvent, RoutingTable, TableKind, TableSettings};
