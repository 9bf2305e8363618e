use crate::{
    config::Config,
    contact::Contact,
    error::{DhtError, RpcError},
    id::NodeId,
    lookup::{self, LookupKind},
    message::{PingRequest, Request, Response, StoreRequest},
    routing::RoutingTable,
    storage::{Origin, PublishPolicy, ValueStore},
    transport::{RequestHandler, Transport},
    value::Value,
};
use futures_util::{future, stream::FuturesUnordered, StreamExt};
use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};
use tokio::{task, time};

/// A DHT node: its routing table, its value store and the requests operating on them.
///
/// This type is cheaply cloneable where each clone refers to the same node. Locks are never held
/// across an await point.
#[derive(Clone)]
pub(crate) struct Dht {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<Config>,
    table: Mutex<RoutingTable>,
    store: Mutex<ValueStore>,
    transport: Arc<dyn Transport>,
    bootstrapped: AtomicBool,
    // Addresses with a ping in flight.
    pinging: Mutex<HashSet<SocketAddr>>,
}

impl Dht {
    pub fn new(config: Arc<Config>, table: RoutingTable, transport: Arc<dyn Transport>) -> Self {
        let store = ValueStore::new(config.value_lifetime);

        Self {
            inner: Arc::new(Inner {
                config,
                table: Mutex::new(table),
                store: Mutex::new(store),
                transport,
                bootstrapped: AtomicBool::new(false),
                pinging: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Start answering incoming requests.
    pub fn bind(&self) {
        let handler = Handler(Arc::downgrade(&self.inner));
        self.inner.transport.bind(Arc::new(handler));
    }

    pub fn unbind(&self) {
        self.inner.transport.unbind();
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn local(&self) -> Contact {
        self.table().local().clone()
    }

    pub fn local_id(&self) -> NodeId {
        self.table().local_id()
    }

    pub fn table(&self) -> MutexGuard<'_, RoutingTable> {
        self.inner.table.lock().unwrap()
    }

    pub fn store(&self) -> MutexGuard<'_, ValueStore> {
        self.inner.store.lock().unwrap()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.inner.bootstrapped.load(Ordering::Acquire)
    }

    pub fn set_bootstrapped(&self, bootstrapped: bool) {
        self.inner.bootstrapped.store(bootstrapped, Ordering::Release);
    }

    /// Ping an address and return the contact that answered. At most one ping per address is in
    /// flight at a time.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Contact, DhtError> {
        let _guard = PingGuard::acquire(&self.inner, addr)?;

        let request = Request::Ping(PingRequest {
            sender: self.local(),
        });
        let response = self.send(addr, request).await?;

        Ok(self.sighted(response.sender, addr))
    }

    /// Ping all the addresses at once and return the first contact that answers.
    pub async fn ping_first(&self, addrs: Vec<SocketAddr>) -> Result<Contact, DhtError> {
        let mut pings: FuturesUnordered<_> = addrs.into_iter().map(|addr| self.ping(addr)).collect();
        let mut last_error = DhtError::NoContacts;

        while let Some(result) = pings.next().await {
            match result {
                Ok(contact) => return Ok(contact),
                Err(error) => last_error = error,
            }
        }

        Err(last_error)
    }

    /// Send a request to a known contact, keeping the routing table in sync with the outcome.
    pub async fn request(&self, contact: &Contact, request: Request) -> Result<Response, DhtError> {
        match self.send(contact.addr, request).await {
            Ok(response) => {
                if response.sender.id != contact.id {
                    log::debug!("{} answered as {:x}", contact, response.sender.id);
                    self.table().handle_failure(&contact.id, &contact.addr);
                }

                self.sighted(response.sender.clone(), contact.addr);
                Ok(response)
            }
            Err(error) => {
                log::trace!("Request to {} failed: {}", contact, error);
                self.table().handle_failure(&contact.id, &contact.addr);
                Err(error)
            }
        }
    }

    async fn send(&self, addr: SocketAddr, request: Request) -> Result<Response, DhtError> {
        let response = time::timeout(
            self.inner.config.rpc_timeout,
            self.inner.transport.send_request(addr, request),
        )
        .await;

        match response {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(RpcError::Timeout)) | Err(_) => Err(DhtError::Timeout),
            Ok(Err(error)) => Err(error.into()),
        }
    }

    // Record a contact we just heard from directly. `addr` is where it was heard from, which
    // wins over whatever address the contact claims.
    fn sighted(&self, contact: Contact, addr: SocketAddr) -> Contact {
        let mut contact = contact.from_wire();
        contact.addr = addr;
        contact.mark_alive();

        self.admit(contact.clone());
        contact
    }

    // Add a directly seen contact to the routing table. A live contact is not moved to another
    // address until its current address stops answering.
    fn admit(&self, contact: Contact) {
        let mut table = self.table();

        if contact.id == table.local_id() {
            return;
        }

        match table.get(&contact.id) {
            Some(existing) if existing.addr != contact.addr && existing.is_alive() => {
                drop(table);
                self.verify_address_change(existing, contact);
            }
            _ => {
                table.add(contact);
            }
        }
    }

    fn verify_address_change(&self, existing: Contact, contact: Contact) {
        log::debug!("{} claims the id of live contact {}", contact.addr, existing);

        let dht = self.clone();
        task::spawn(async move {
            match dht.ping(existing.addr).await {
                Ok(responder) if responder.id == existing.id => {
                    log::debug!("{} still answers, ignoring {}", existing, contact.addr);
                }
                Err(DhtError::AlreadyPinging(_)) => (),
                _ => {
                    let mut table = dht.table();
                    table.handle_failure(&existing.id, &existing.addr);
                    table.add(contact);
                }
            }
        });
    }

    /// Contacts closest to `target` found by an iterative lookup.
    pub async fn find_node(&self, target: NodeId) -> Vec<Contact> {
        lookup::run(self, target, LookupKind::Node, Vec::new())
            .await
            .closest
    }

    /// Fill the routing table starting from a contact that just answered a ping: look up the
    /// local id, then refresh every bucket further away.
    ///
    /// Fails with `DhtError::Collision` if another live node answers with the local id.
    pub async fn bootstrap_from(&self, contact: Contact) -> Result<usize, DhtError> {
        let local_id = self.local_id();
        let outcome = lookup::run(self, local_id, LookupKind::Node, vec![contact]).await;

        self.check_collision(outcome.claimants).await?;

        let targets = self.table().refresh_targets();
        future::join_all(
            targets
                .into_iter()
                .map(|target| lookup::run(self, target, LookupKind::Node, Vec::new())),
        )
        .await;

        Ok(self.table().size())
    }

    async fn check_collision(&self, claimants: Vec<Contact>) -> Result<(), DhtError> {
        let local_id = self.local_id();
        let mut checked = HashSet::new();

        for claimant in claimants {
            if !checked.insert(claimant.addr) {
                continue;
            }

            log::debug!("Checking if {} really uses our id", claimant.addr);

            if let Ok(responder) = self.ping(claimant.addr).await {
                if responder.id == local_id {
                    return Err(DhtError::Collision(local_id, claimant.addr));
                }
            }
        }

        Ok(())
    }

    /// Values stored under `key`, locally and on the nodes closest to it.
    pub async fn get(&self, key: NodeId) -> Result<Vec<Value>, DhtError> {
        let mut values = self.store().get(&key);
        let outcome = lookup::run(self, key, LookupKind::Value, Vec::new()).await;

        for value in outcome.values {
            if values.iter().any(|v| v.creator.id == value.creator.id) {
                continue;
            }

            if let Err(error) = self.store().store(value.clone(), Origin::Remote) {
                log::debug!("Dropping value for {} from {}: {}", key, value.creator, error);
                continue;
            }

            values.push(value);
        }

        Ok(values)
    }

    /// Store a value created by this node and publish it. Returns the contacts that accepted it.
    pub async fn put(&self, mut value: Value) -> Result<Vec<Contact>, DhtError> {
        value.creator = self.local();
        self.store().store(value.clone(), Origin::Local)?;

        Ok(self.publish(value).await)
    }

    /// Stop publishing the local value under `key`. Its tombstone goes out with the next publish
    /// cycle.
    pub fn remove(&self, key: &NodeId) -> bool {
        let local_id = self.local_id();
        self.store().remove_local(key, &local_id)
    }

    /// Publish every local value the policy still wants, and the tombstones of the rest.
    /// Returns the number of values sent out.
    pub async fn publish_cycle(&self, policy: &dyn PublishPolicy) -> usize {
        let values = {
            let mut store = self.store();
            let evicted = store.evict_expired();
            if evicted > 0 {
                log::debug!("Evicted {} expired values", evicted);
            }
            store.values_to_publish(policy)
        };

        let count = values.len();

        for value in values {
            let key = value.key;
            let stored = self.publish(value).await;
            log::debug!("Published value for {} to {} contacts", key, stored.len());
        }

        count
    }

    async fn publish(&self, value: Value) -> Vec<Contact> {
        let closest = self.find_node(value.key).await;
        let request = Request::Store(StoreRequest {
            sender: self.local(),
            values: vec![value],
        });

        let mut stores: FuturesUnordered<_> = closest
            .into_iter()
            .map(|contact| {
                let request = request.clone();
                async move {
                    let result = self.request(&contact, request).await;
                    (contact, result)
                }
            })
            .collect();

        let mut stored = Vec::new();

        while let Some((contact, result)) = stores.next().await {
            match result {
                Ok(response) if response.stored.unwrap_or(0) > 0 => stored.push(contact),
                Ok(_) => log::trace!("{} refused to store", contact),
                Err(error) => log::trace!("Store on {} failed: {}", contact, error),
            }
        }

        stored
    }

    fn handle_request(&self, from: SocketAddr, request: Request) -> Response {
        let mut sender = request.sender().clone().from_wire();
        sender.addr = from;
        sender.mark_alive();

        self.admit(sender.clone());

        let (local, nodes) = {
            let table = self.table();
            let k = table.settings().bucket_size;
            let target = match &request {
                Request::FindNode(r) => Some(r.target),
                Request::FindValue(r) => Some(r.key),
                Request::Ping(_) | Request::Store(_) => None,
            };

            let nodes: Vec<Contact> = target
                .map(|target| {
                    table
                        .select(&target, k + 2, false)
                        .into_iter()
                        .filter(|c| c.id != table.local_id())
                        .filter(|c| !(c.id == sender.id && c.addr == sender.addr))
                        .take(k)
                        .collect()
                })
                .unwrap_or_default();

            (table.local().clone(), nodes)
        };

        let mut response = Response::new(local);

        match request {
            Request::Ping(_) => (),
            Request::FindNode(_) => response.nodes = nodes,
            Request::FindValue(r) => {
                let values = self.store().get(&r.key);
                if values.is_empty() {
                    response.nodes = nodes;
                } else {
                    response.values = values;
                }
            }
            Request::Store(r) => {
                let mut store = self.store();
                let mut stored = 0;

                for value in r.values {
                    let accepted = if value.is_tombstone() {
                        store.add(value, Origin::Remote)
                    } else {
                        match store.store(value, Origin::Remote) {
                            Ok(()) => true,
                            Err(error) => {
                                log::debug!("Refusing value from {}: {}", sender, error);
                                false
                            }
                        }
                    };

                    if accepted {
                        stored += 1;
                    }
                }

                response.stored = Some(stored);
            }
        }

        response
    }
}

// Dispatches incoming requests to the node without keeping it alive.
struct Handler(Weak<Inner>);

impl RequestHandler for Handler {
    fn handle_request(&self, from: SocketAddr, request: Request) -> Option<Response> {
        let inner = self.0.upgrade()?;
        Some(Dht { inner }.handle_request(from, request))
    }
}

struct PingGuard<'a> {
    inner: &'a Inner,
    addr: SocketAddr,
}

impl<'a> PingGuard<'a> {
    fn acquire(inner: &'a Inner, addr: SocketAddr) -> Result<Self, DhtError> {
        if inner.pinging.lock().unwrap().insert(addr) {
            Ok(Self { inner, addr })
        } else {
            Err(DhtError::AlreadyPinging(addr))
        }
    }
}

impl Drop for PingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pinging.lock().unwrap().remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        routing::TableSettings,
        test,
        transport::memory::MemoryNetwork,
        value::{AltLoc, PushProxies},
    };
    use std::time::Duration;

    fn config() -> Arc<Config> {
        Arc::new(Config {
            rpc_timeout: Duration::from_millis(500),
            ..Config::default()
        })
    }

    fn node(network: &MemoryNetwork, prefix: u8, index: u16) -> Dht {
        let addr = test::dummy_socket_addr(index);
        let local = Contact::alive(test::node_id_with_prefix(prefix), addr);
        let table = RoutingTable::new(local, TableSettings::default());
        let dht = Dht::new(config(), table, Arc::new(network.transport(addr)));
        dht.bind();
        dht
    }

    #[tokio::test]
    async fn positive_ping_adds_both_sides() {
        let network = MemoryNetwork::new();
        let a = node(&network, 0x10, 1);
        let b = node(&network, 0x80, 2);

        let contact = a.ping(test::dummy_socket_addr(2)).await.unwrap();

        assert_eq!(contact.id, b.local_id());
        assert!(a.table().contains(&b.local_id()));
        assert!(b.table().contains(&a.local_id()));
    }

    #[tokio::test]
    async fn negative_ping_unreachable() {
        let network = MemoryNetwork::new();
        let a = node(&network, 0x10, 1);

        assert!(matches!(
            a.ping(test::dummy_socket_addr(2)).await,
            Err(DhtError::Timeout)
        ));
    }

    #[tokio::test]
    async fn positive_ping_first_skips_dead_addresses() {
        let network = MemoryNetwork::new();
        let a = node(&network, 0x10, 1);
        let b = node(&network, 0x80, 2);

        let contact = a
            .ping_first(vec![test::dummy_socket_addr(7), test::dummy_socket_addr(2)])
            .await
            .unwrap();

        assert_eq!(contact.id, b.local_id());
    }

    #[tokio::test]
    async fn negative_ping_first_without_addresses() {
        let network = MemoryNetwork::new();
        let a = node(&network, 0x10, 1);

        assert!(matches!(
            a.ping_first(Vec::new()).await,
            Err(DhtError::NoContacts)
        ));
    }

    #[tokio::test]
    async fn positive_bootstrap_fills_tables() {
        let network = MemoryNetwork::new();
        let seed = node(&network, 0x80, 1);
        let others: Vec<_> = (2..10)
            .map(|i| node(&network, ((i as u8) << 4) | 0x01, i))
            .collect();

        for other in &others {
            other.ping(test::dummy_socket_addr(1)).await.unwrap();
        }

        let a = node(&network, 0x01, 20);
        let contact = a.ping(test::dummy_socket_addr(1)).await.unwrap();
        let size = a.bootstrap_from(contact).await.unwrap();

        assert_eq!(size, others.len() + 1);
        assert!(seed.table().contains(&a.local_id()));
    }

    #[tokio::test]
    async fn negative_bootstrap_detects_collision() {
        let network = MemoryNetwork::new();
        let seed = node(&network, 0x80, 1);
        let twin = node(&network, 0x01, 2);
        twin.ping(test::dummy_socket_addr(1)).await.unwrap();
        assert!(seed.table().contains(&twin.local_id()));

        // Same id as `twin`, different address.
        let a = node(&network, 0x01, 3);
        let contact = a.ping(test::dummy_socket_addr(1)).await.unwrap();

        assert!(matches!(
            a.bootstrap_from(contact).await,
            Err(DhtError::Collision(_, addr)) if addr == test::dummy_socket_addr(2)
        ));
    }

    #[tokio::test]
    async fn positive_put_and_get() {
        let network = MemoryNetwork::new();
        let a = node(&network, 0x10, 1);
        let b = node(&network, 0x80, 2);
        let c = node(&network, 0xc0, 3);

        a.ping(test::dummy_socket_addr(2)).await.unwrap();
        c.ping(test::dummy_socket_addr(2)).await.unwrap();

        let key = test::node_id_with_prefix(0x81);
        let value = Value::alt_loc(
            key,
            a.local(),
            &AltLoc {
                guid: [1; 16],
                port: 6346,
                firewall: None,
            },
        );

        let stored = a.put(value.clone()).await.unwrap();
        assert!(!stored.is_empty());
        assert_eq!(b.store().get(&key).len(), 1);

        let values = c.get(key).await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].creator.id, a.local_id());
        assert_eq!(values[0].payload, value.payload);
    }

    #[tokio::test]
    async fn negative_put_invalid_value() {
        let network = MemoryNetwork::new();
        let a = node(&network, 0x10, 1);

        let mut value = Value::push_proxies(
            test::node_id_with_prefix(0x20),
            a.local(),
            &PushProxies::default(),
        );
        value.payload = vec![3];

        assert!(matches!(
            a.put(value).await,
            Err(DhtError::InvalidValue(_))
        ));
        assert!(a.store().is_empty());
    }

    #[tokio::test]
    async fn positive_remove_publishes_tombstone() {
        struct Keep;

        impl PublishPolicy for Keep {
            fn is_rare(&self, _: &NodeId) -> bool {
                true
            }

            fn is_firewalled(&self) -> bool {
                true
            }
        }

        let network = MemoryNetwork::new();
        let a = node(&network, 0x10, 1);
        let b = node(&network, 0x80, 2);
        a.ping(test::dummy_socket_addr(2)).await.unwrap();

        let key = test::node_id_with_prefix(0x81);
        let value = Value::alt_loc(
            key,
            a.local(),
            &AltLoc {
                guid: [1; 16],
                port: 6346,
                firewall: None,
            },
        );
        a.put(value).await.unwrap();
        assert_eq!(b.store().get(&key).len(), 1);

        assert!(a.remove(&key));
        assert_eq!(a.publish_cycle(&Keep).await, 1);

        assert!(b.store().get(&key).is_empty());
        assert!(!a.store().contains_key(&key));
    }

    #[tokio::test]
    async fn negative_failed_request_marks_contact() {
        let network = MemoryNetwork::new();
        let a = node(&network, 0x10, 1);
        let b = node(&network, 0x80, 2);
        a.ping(test::dummy_socket_addr(2)).await.unwrap();

        let contact = a.table().get(&b.local_id()).unwrap();
        b.unbind();

        let request = Request::Ping(PingRequest { sender: a.local() });
        assert!(a.request(&contact, request).await.is_err());
        assert!(!a.table().contains(&b.local_id()));
    }
}
