use crate::{
    config::Config,
    contact::Vendor,
    controller::Context,
    host::GnutellaHost,
    manager::DhtManager,
    mode::Mode,
    socket::SocketTrait,
    storage::PublishPolicy,
    transport::{Transport, UdpTransport},
};
use std::{io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc};

// Lifecycle events are few; a subscriber lagging this far behind has stopped listening.
const EVENT_CAPACITY: usize = 64;

/// Stores information for initializing a DHT.
#[derive(Debug, Default)]
pub struct DhtBuilder {
    config: Config,
    mode: Mode,
}

impl DhtBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration. Settings made before are lost.
    pub fn set_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Mode to start in. Defaults to inactive, in which case nothing runs until
    /// [`DhtManager::start`] is called.
    pub fn set_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Add a host to bootstrap from when no other host is known. Each node picks one of these by
    /// its id.
    pub fn add_bootstrap_host(mut self, addr: SocketAddr) -> Self {
        self.config.bootstrap_hosts.push(addr);
        self
    }

    /// Add bootstrap hosts. Same as calling `add_bootstrap_host` multiple times but more
    /// convenient in some cases.
    pub fn add_bootstrap_hosts<I>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        self.config.bootstrap_hosts.extend(hosts);
        self
    }

    /// Directory the routing tables are saved to between runs. Nothing is saved if not set.
    pub fn set_settings_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.settings_dir = Some(dir.into());
        self
    }

    /// Vendor code and version the local contact advertises.
    pub fn set_vendor(mut self, vendor: Vendor, version: u16) -> Self {
        self.config.vendor = vendor;
        self.config.version = version;
        self
    }

    /// Maximum number of contacts per bucket (K).
    pub fn set_bucket_size(mut self, bucket_size: usize) -> Self {
        self.config.table.bucket_size = bucket_size;
        self
    }

    pub fn set_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    pub fn set_publish_interval(mut self, interval: Duration) -> Self {
        self.config.publish_interval = interval;
        self
    }

    /// Whether an ultrapeer forwards the contacts it learns to its passive leaves. Defaults to
    /// true.
    pub fn set_forward_contacts_to_leaves(mut self, forward: bool) -> Self {
        self.config.forward_contacts_to_leaves = forward;
        self
    }

    /// Run even when the host reports no Gnutella connectivity.
    pub fn set_force_connect(mut self, force: bool) -> Self {
        self.config.force_connect = force;
        self
    }

    /// Start the DHT on the given transport. Must be called within a tokio runtime.
    pub fn start<T: Transport>(
        self,
        transport: T,
        host: Arc<dyn GnutellaHost>,
        policy: Arc<dyn PublishPolicy>,
    ) -> DhtManager {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (collisions_tx, collisions_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(Context {
            config: Arc::new(self.config),
            host,
            transport: Arc::new(transport),
            policy,
            events,
            collisions: collisions_tx,
        });

        DhtManager::with_context(ctx, collisions_rx, self.mode)
    }

    /// Start the DHT on its own UDP socket. Fails only if `socket.local_addr()` fails.
    pub fn start_udp<S: SocketTrait>(
        self,
        socket: S,
        host: Arc<dyn GnutellaHost>,
        policy: Arc<dyn PublishPolicy>,
    ) -> io::Result<DhtManager> {
        let transport = UdpTransport::new(socket)?;
        Ok(self.start(transport, host, policy))
    }
}
