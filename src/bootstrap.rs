//! Gets a fresh routing table connected to the rest of the DHT.
//!
//! Candidates are tried in order: the contacts of a persisted table, then hosts reported by the
//! Gnutella side (most recent first), then one configured fallback host. When all of them fail
//! the bootstrapper waits for more hosts and has the discovery feed ask for them.

use crate::{
    config::Config,
    contact::Contact,
    dht::Dht,
    discovery::NodeDiscoveryFeed,
    error::DhtError,
    host::GnutellaHost,
    lifo::LifoSet,
    mode::Mode,
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    sync::{mpsc, watch, Notify},
    task::{self, JoinHandle},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    Idle,
    Bootstrapping,
    /// Every candidate failed; waiting for new hosts.
    Waiting,
    Bootstrapped,
}

pub(crate) struct Bootstrapper {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    dht: Dht,
    mode: Mode,
    hosts: Mutex<LifoSet<SocketAddr>>,
    hosts_added: Notify,
    state_tx: watch::Sender<BootstrapState>,
    discovery: NodeDiscoveryFeed,
    collisions: mpsc::UnboundedSender<Mode>,
    collided: AtomicBool,
    fallback: Option<SocketAddr>,
    ping_count: usize,
}

impl Bootstrapper {
    pub fn new(
        dht: Dht,
        mode: Mode,
        config: &Config,
        host: Arc<dyn GnutellaHost>,
        collisions: mpsc::UnboundedSender<Mode>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(BootstrapState::Idle);
        let fallback = fallback_host(&config.bootstrap_hosts, &dht.local());

        Self {
            shared: Arc::new(Shared {
                dht,
                mode,
                hosts: Mutex::new(LifoSet::new(config.max_bootstrap_hosts)),
                hosts_added: Notify::new(),
                state_tx,
                discovery: NodeDiscoveryFeed::new(host, config, state_rx),
                collisions,
                collided: AtomicBool::new(false),
                fallback,
                ping_count: config.bootstrap_ping_count,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start bootstrapping. `seeded` tells whether the routing table was loaded from disk, in
    /// which case its contacts are tried first. Does nothing if already started.
    pub fn start(&self, seeded: bool) {
        let mut worker = self.worker.lock().unwrap();

        if worker.is_some() {
            return;
        }

        *worker = Some(task::spawn(self.shared.clone().run(seeded)));
    }

    /// Stop bootstrapping and forget the queued hosts. Safe to call more than once.
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }

        self.shared.discovery.stop();
        self.shared.hosts.lock().unwrap().clear();

        if self.state() != BootstrapState::Bootstrapped {
            self.shared.set_state(BootstrapState::Idle);
        }
    }

    /// Queue an address of an active DHT node to bootstrap from. Ignored once bootstrapped.
    pub fn add_host(&self, addr: SocketAddr) {
        if self.state() == BootstrapState::Bootstrapped {
            return;
        }

        self.shared.hosts.lock().unwrap().push(addr);
        self.shared.hosts_added.notify_one();
    }

    /// A passive node was reported. It cannot bootstrap us, but it may know active nodes.
    pub fn add_passive_host(&self, addr: SocketAddr) {
        if self.is_waiting_for_nodes() {
            self.shared.discovery.request_from(addr);
        }
    }

    pub fn state(&self) -> BootstrapState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_waiting_for_nodes(&self) -> bool {
        self.state() == BootstrapState::Waiting
    }

    /// Whether bootstrapping ended because another node uses the local id.
    pub fn collided(&self) -> bool {
        self.shared.collided.load(Ordering::Acquire)
    }
}

impl Drop for Bootstrapper {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }
}

impl Shared {
    fn set_state(&self, state: BootstrapState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                log::info!("{} bootstrap: {:?} -> {:?}", self.mode, current, state);
                *current = state;
                true
            }
        });
    }

    async fn run(self: Arc<Self>, seeded: bool) {
        let mut try_table = seeded;
        let mut try_fallback = self.fallback.is_some();

        loop {
            let candidate = if try_table {
                try_table = false;

                let addrs: Vec<_> = self
                    .dht
                    .table()
                    .most_recently_seen(self.ping_count)
                    .into_iter()
                    .map(|c| c.addr)
                    .collect();

                if addrs.is_empty() {
                    continue;
                }

                self.set_state(BootstrapState::Bootstrapping);
                log::debug!("Pinging {} contacts of the persisted table", addrs.len());
                self.dht.ping_first(addrs).await
            } else if let Some(addr) = self.pop_host() {
                self.set_state(BootstrapState::Bootstrapping);
                self.dht.ping(addr).await
            } else if let (true, Some(addr)) = (try_fallback, self.fallback) {
                try_fallback = false;
                self.set_state(BootstrapState::Bootstrapping);
                log::debug!("Trying fallback bootstrap host {}", addr);
                self.dht.ping(addr).await
            } else {
                self.set_state(BootstrapState::Waiting);
                self.discovery.start();
                self.hosts_added.notified().await;
                continue;
            };

            let contact = match candidate {
                Ok(contact) => contact,
                Err(error) => {
                    log::debug!("Bootstrap candidate failed: {}", error);
                    continue;
                }
            };

            if self.bootstrap_from(contact).await {
                return;
            }
        }
    }

    // Returns true when bootstrapping is over, successfully or not.
    async fn bootstrap_from(&self, contact: Contact) -> bool {
        log::debug!("Bootstrapping from {}", contact);

        match self.dht.bootstrap_from(contact).await {
            Ok(size) if size > 0 => {
                log::info!("{} bootstrap complete with {} contacts", self.mode, size);
                self.dht.set_bootstrapped(true);
                self.discovery.stop();
                self.set_state(BootstrapState::Bootstrapped);
                true
            }
            Ok(_) => {
                log::debug!("Bootstrap left the routing table empty");
                false
            }
            Err(DhtError::Collision(id, addr)) => {
                log::warn!("{} node id {:x} collides with {}", self.mode, id, addr);
                self.collided.store(true, Ordering::Release);
                self.discovery.stop();
                self.set_state(BootstrapState::Idle);
                self.collisions.send(self.mode).ok();
                true
            }
            Err(error) => {
                log::debug!("Bootstrap failed: {}", error);
                false
            }
        }
    }

    fn pop_host(&self) -> Option<SocketAddr> {
        self.hosts.lock().unwrap().pop()
    }
}

// Spread nodes over the fallback hosts by the top bits of their id.
fn fallback_host(hosts: &[SocketAddr], local: &Contact) -> Option<SocketAddr> {
    if hosts.is_empty() {
        return None;
    }

    let index = (local.id.as_ref()[0] >> 4) as usize % hosts.len();
    Some(hosts[index])
}
