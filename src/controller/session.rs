use super::Context;
use crate::{
    bootstrap::{BootstrapState, Bootstrapper},
    contact::Contact,
    dht::Dht,
    error::DhtError,
    event::DhtEvent,
    future::DhtFuture,
    host::GnutellaHost,
    id::NodeId,
    mode::Mode,
    propagation::{ContactPusher, ContactSink},
    routing::{RouteTableEvent, RoutingTable},
    time,
    value::Value,
};
use std::{
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::{
    sync::{mpsc, watch},
    task::{self, JoinHandle},
};

/// Everything a running controller owns: the node, its bootstrapper, the contact propagation in
/// both directions and the background tasks. Dropped as a whole when the controller stops.
pub(crate) struct Session {
    mode: Mode,
    ctx: Arc<Context>,
    dht: Dht,
    // Leaves have no bootstrapper; their routing table is usable from the start.
    bootstrapper: Option<Bootstrapper>,
    state: watch::Receiver<BootstrapState>,
    _fixed_state: Option<watch::Sender<BootstrapState>>,
    sink: ContactSink,
    pusher: Arc<ContactPusher>,
    tasks: Vec<JoinHandle<()>>,
    operations: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Bind `table` to the transport and start bootstrapping. `seeded` tells whether the table
    /// was loaded from disk.
    pub fn start(ctx: Arc<Context>, mode: Mode, mut table: RoutingTable, seeded: bool) -> Self {
        let table_events = table.subscribe();
        let local_id = table.local_id();

        log::info!("Starting {} DHT as {}", mode, table.local());
        ctx.events.send(DhtEvent::Starting(mode)).ok();

        let dht = Dht::new(ctx.config.clone(), table, ctx.transport.clone());
        dht.bind();

        let pusher = Arc::new(ContactPusher::new(ctx.host.clone(), &ctx.config, local_id));
        let sink = ContactSink::new(dht.clone(), &ctx.config);

        let (bootstrapper, state, fixed_state) = if mode == Mode::PassiveLeaf {
            dht.set_bootstrapped(true);
            let (tx, rx) = watch::channel(BootstrapState::Bootstrapped);
            (None, rx, Some(tx))
        } else {
            let bootstrapper = Bootstrapper::new(
                dht.clone(),
                mode,
                &ctx.config,
                ctx.host.clone(),
                ctx.collisions.clone(),
            );
            let state = bootstrapper.subscribe();
            bootstrapper.start(seeded);
            (Some(bootstrapper), state, None)
        };

        let mut tasks = vec![
            task::spawn(announce_connected(ctx.clone(), mode, state.clone())),
            task::spawn(publish_loop(ctx.clone(), dht.clone())),
        ];

        if ctx.config.forward_contacts_to_leaves && mode != Mode::PassiveLeaf {
            tasks.push(task::spawn(forward_contacts(
                ctx.host.clone(),
                pusher.clone(),
                table_events,
            )));
        }

        Self {
            mode,
            ctx,
            dht,
            bootstrapper,
            state,
            _fixed_state: fixed_state,
            sink,
            pusher,
            tasks,
            operations: Mutex::new(Vec::new()),
        }
    }

    pub fn dht(&self) -> &Dht {
        &self.dht
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
        self.state.clone()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.dht.is_bootstrapped()
    }

    pub fn is_waiting_for_nodes(&self) -> bool {
        self.bootstrap_state() == BootstrapState::Waiting
    }

    pub fn collided(&self) -> bool {
        self.bootstrapper.as_ref().map_or(false, |b| b.collided())
    }

    /// An active DHT node was reported. Before bootstrapping it is a bootstrap candidate,
    /// afterwards it is verified and kept as a priority contact.
    pub fn add_active_node(&self, addr: SocketAddr) {
        match &self.bootstrapper {
            Some(bootstrapper) if !self.is_bootstrapped() => bootstrapper.add_host(addr),
            _ => self.sink.add(addr),
        }
    }

    pub fn add_passive_node(&self, addr: SocketAddr) {
        if let Some(bootstrapper) = &self.bootstrapper {
            bootstrapper.add_passive_host(addr);
        }
    }

    /// Contacts pushed by an ultrapeer. Only a leaf takes them, as they are; other modes
    /// learn contacts through their own lookups.
    pub fn add_contacts(&self, contacts: Vec<Contact>) {
        if self.mode != Mode::PassiveLeaf {
            return;
        }

        let mut table = self.dht.table();
        let local_id = table.local_id();

        for contact in contacts.into_iter().filter(|c| c.id != local_id) {
            table.add(contact.from_wire());
        }
    }

    /// Ping the ultrapeer a leaf connected to and pin it in the routing table.
    pub fn add_priority_node(&self, addr: SocketAddr) {
        let dht = self.dht.clone();
        self.spawn_task(async move {
            match dht.ping(addr).await {
                Ok(contact) => {
                    log::debug!("Ultrapeer {} is a priority contact", contact);
                    dht.table().add_priority(contact);
                }
                Err(error) => log::debug!("Ultrapeer {} did not answer a ping: {}", addr, error),
            }
        });
    }

    /// Forget the contact at `addr`, e.g. an ultrapeer the leaf disconnected from.
    pub fn remove_node(&self, addr: SocketAddr) {
        let mut table = self.dht.table();
        let local_id = table.local_id();

        let found = table
            .active_contacts()
            .into_iter()
            .find(|c| c.addr == addr && c.id != local_id);

        if let Some(contact) = found {
            log::debug!("Dropping {}", contact);
            table.remove(&contact.id);
        }
    }

    pub fn get(&self, key: NodeId) -> DhtFuture<Vec<Value>> {
        let dht = self.dht.clone();
        self.spawn_operation(async move { dht.get(key).await })
    }

    pub fn put(&self, value: Value) -> DhtFuture<Vec<Contact>> {
        let dht = self.dht.clone();
        self.spawn_operation(async move { dht.put(value).await })
    }

    pub fn remove(&self, key: NodeId) -> DhtFuture<bool> {
        DhtFuture::ready(Ok(self.dht.remove(&key)))
    }

    /// Stop everything and unbind from the transport. The node is handed back so its routing
    /// table can be saved.
    pub fn stop(self) -> Dht {
        if let Some(bootstrapper) = &self.bootstrapper {
            bootstrapper.stop();
        }

        self.sink.stop();
        self.pusher.stop();

        for task in &self.tasks {
            task.abort();
        }

        for operation in self.operations.lock().unwrap().drain(..) {
            operation.abort();
        }

        self.dht.unbind();

        if self.dht.is_bootstrapped() {
            self.ctx.host.capabilities_changed(Mode::Inactive);
        }

        self.dht.set_bootstrapped(false);

        log::info!("{} DHT stopped", self.mode);
        self.ctx.events.send(DhtEvent::Stopped(self.mode)).ok();

        self.dht.clone()
    }

    fn spawn_operation<T, F>(&self, future: F) -> DhtFuture<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, DhtError>> + Send + 'static,
    {
        let (future, handle) = DhtFuture::spawn(future);
        self.track(handle);
        future
    }

    /// Run `future` until it completes or the session stops. Nobody waits for the outcome.
    fn spawn_task<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.track(task::spawn(future));
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut operations = self.operations.lock().unwrap();
        operations.retain(|operation| !operation.is_finished());
        operations.push(handle);
    }
}

async fn announce_connected(
    ctx: Arc<Context>,
    mode: Mode,
    mut state: watch::Receiver<BootstrapState>,
) {
    loop {
        if *state.borrow_and_update() == BootstrapState::Bootstrapped {
            log::info!("{} DHT connected", mode);
            ctx.events.send(DhtEvent::Connected(mode)).ok();
            ctx.host.capabilities_changed(mode);
            return;
        }

        if state.changed().await.is_err() {
            return;
        }
    }
}

async fn publish_loop(ctx: Arc<Context>, dht: Dht) {
    let mut interval = time::interval(ctx.config.publish_interval);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;

        if !dht.is_bootstrapped() {
            continue;
        }

        let purged = dht.table().purge(ctx.config.max_contact_age);
        if purged > 0 {
            log::debug!("Purged {} stale contacts", purged);
        }

        let published = dht.publish_cycle(ctx.policy.as_ref()).await;
        log::debug!("Published {} values", published);
    }
}

async fn forward_contacts(
    host: Arc<dyn GnutellaHost>,
    pusher: Arc<ContactPusher>,
    mut events: mpsc::UnboundedReceiver<RouteTableEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            RouteTableEvent::ContactAdded(contact) | RouteTableEvent::ContactUpdated(contact) => {
                if contact.is_alive() && host.is_ultrapeer() {
                    pusher.push(contact);
                }
            }
            _ => (),
        }
    }
}
