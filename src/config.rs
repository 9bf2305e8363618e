use crate::{contact::Vendor, routing::TableSettings};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

/// Vendor code this implementation identifies itself with.
pub const DEFAULT_VENDOR: Vendor = Vendor::from_code(*b"GDHT");

/// Current version of the persisted routing table format.
pub const ROUTE_TABLE_VERSION: u32 = 1;

/// Tunables of the DHT. `Config::default()` gives production values.
#[derive(Clone, Debug)]
pub struct Config {
    pub vendor: Vendor,
    pub version: u16,

    /// Bucket size (K), replacement cache size and per-class cap of the routing table.
    pub table: TableSettings,
    /// Number of requests a lookup keeps in flight.
    pub lookup_parallelism: usize,
    /// How long to wait for any single response.
    pub rpc_timeout: Duration,

    /// How many persisted contacts are pinged at once when bootstrapping from a saved table.
    pub bootstrap_ping_count: usize,
    /// Capacity of the set of bootstrap candidates. The oldest candidates are evicted first.
    pub max_bootstrap_hosts: usize,
    /// Last resort bootstrap hosts. One is chosen per node id.
    pub bootstrap_hosts: Vec<SocketAddr>,

    /// How often connected peers are asked for DHT hosts while waiting for them.
    pub discovery_interval: Duration,
    /// Minimum delay between two host requests.
    pub discovery_min_interval: Duration,

    /// Whether an ultrapeer forwards fresh contacts to its passive leaves.
    pub forward_contacts_to_leaves: bool,
    pub contact_push_interval: Duration,
    /// Number of most recent contacts kept for the next push.
    pub contact_push_batch: usize,
    /// Delay between two pings of contacts received from the Gnutella side.
    pub contact_sink_interval: Duration,
    pub contact_sink_capacity: usize,

    /// How often local values are republished.
    pub publish_interval: Duration,
    /// How long a value stored on behalf of another node is kept.
    pub value_lifetime: Duration,

    /// Where routing tables are persisted. Nothing is persisted when `None`.
    pub settings_dir: Option<PathBuf>,
    pub persist_active_table: bool,
    pub persist_passive_table: bool,
    /// Persisted tables older than these versions are discarded.
    pub min_active_table_version: u32,
    pub min_passive_table_version: u32,
    /// Passive mode only saves this many of the most recently seen contacts.
    pub max_persisted_nodes: usize,
    /// Persisted contacts not seen for longer than this are dropped on load.
    pub max_contact_age: Duration,

    /// Run the DHT even when the host reports no Gnutella connectivity.
    pub force_connect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vendor: DEFAULT_VENDOR,
            version: 1,
            table: TableSettings::default(),
            lookup_parallelism: 3,
            rpc_timeout: Duration::from_secs(5),
            bootstrap_ping_count: 8,
            max_bootstrap_hosts: 50,
            bootstrap_hosts: Vec::new(),
            discovery_interval: Duration::from_secs(30 * 60),
            discovery_min_interval: Duration::from_secs(60),
            forward_contacts_to_leaves: true,
            contact_push_interval: Duration::from_secs(60),
            contact_push_batch: 10,
            contact_sink_interval: Duration::from_secs(30),
            contact_sink_capacity: 30,
            publish_interval: Duration::from_secs(30 * 60),
            value_lifetime: Duration::from_secs(60 * 60),
            settings_dir: None,
            persist_active_table: true,
            persist_passive_table: true,
            min_active_table_version: ROUTE_TABLE_VERSION,
            min_passive_table_version: ROUTE_TABLE_VERSION,
            max_persisted_nodes: 40,
            max_contact_age: Duration::from_secs(30 * 24 * 60 * 60),
            force_connect: false,
        }
    }
}
