use crate::{
    bootstrap::BootstrapState,
    builder::DhtBuilder,
    contact::Contact,
    controller::{self, Context, Controller, ControllerState},
    error::DhtError,
    event::{ConnectionEvent, DhtEvent, DhtHost},
    future::DhtFuture,
    id::NodeId,
    mode::Mode,
    value::Value,
};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    select,
    sync::{broadcast, mpsc, oneshot, watch},
    task, time,
};

/// Runs the DHT of a Gnutella node in whatever mode the node currently needs.
///
/// This type is cheaply cloneable where each clone refers to the same manager. Every call that
/// changes the DHT is queued and executed in order by a single task, so a mode switch always
/// completes before the next call sees the DHT. The DHT shuts down once every clone is dropped.
#[derive(Clone)]
pub struct DhtManager {
    send: mpsc::UnboundedSender<Command>,
    status: Arc<Mutex<Status>>,
    events: broadcast::Sender<DhtEvent>,
}

enum Command {
    Start(Mode, oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    ConnectionEvent(ConnectionEvent),
    AddressChanged,
    AddActiveNode(SocketAddr),
    AddPassiveNode(SocketAddr),
    DhtHosts(Vec<DhtHost>),
    DhtContacts(Vec<Contact>),
    Get(NodeId, oneshot::Sender<Result<DhtFuture<Vec<Value>>, DhtError>>),
    Put(Value, oneshot::Sender<Result<DhtFuture<Vec<Contact>>, DhtError>>),
    Remove(NodeId, oneshot::Sender<Result<DhtFuture<bool>, DhtError>>),
    ActiveNodes(usize, oneshot::Sender<Vec<Contact>>),
    LocalContact(oneshot::Sender<Option<Contact>>),
}

// Readable without going through the queue.
struct Status {
    mode: Mode,
    transition: Option<ControllerState>,
    bootstrap: Option<watch::Receiver<BootstrapState>>,
}

impl Status {
    fn state(&self) -> ControllerState {
        if let Some(transition) = self.transition {
            return transition;
        }

        match &self.bootstrap {
            Some(bootstrap) => ControllerState::Running(*bootstrap.borrow()),
            None => ControllerState::NotRunning,
        }
    }
}

impl DhtManager {
    /// Create a new DhtBuilder.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::new()
    }

    /// Start the manager with the given context and switch to `mode` right away.
    pub(crate) fn with_context(
        ctx: Arc<Context>,
        collisions: mpsc::UnboundedReceiver<Mode>,
        mode: Mode,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(Status {
            mode: Mode::Inactive,
            transition: None,
            bootstrap: None,
        }));
        let events = ctx.events.clone();

        let worker = ManagerWorker {
            controller: Controller::Inactive,
            wanted: mode,
            ctx,
            status: status.clone(),
            command_rx,
            collisions,
        };

        if mode != Mode::Inactive {
            let (done, _) = oneshot::channel();
            if command_tx.send(Command::Start(mode, done)).is_err() {
                // `unreachable` is OK here because the corresponding receiver definitely exists
                // at this point inside `worker`.
                unreachable!()
            }
        }

        task::spawn(worker.run());

        Self {
            send: command_tx,
            status,
            events,
        }
    }

    /// Switch to `mode`, stopping the current controller first. Completes once the new
    /// controller has started.
    pub async fn start(&self, mode: Mode) {
        let (tx, rx) = oneshot::channel();
        if self.send.send(Command::Start(mode, tx)).is_ok() {
            rx.await.ok();
        }
    }

    /// Stop the current controller. It stays selected and starts again on the next
    /// [`start`](Self::start) or connection.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send.send(Command::Stop(tx)).is_ok() {
            rx.await.ok();
        }
    }

    pub fn handle_connection_event(&self, event: ConnectionEvent) {
        self.enqueue(Command::ConnectionEvent(event));
    }

    /// The external address of the host changed. A running controller restarts to rebind its
    /// local contact.
    pub fn address_changed(&self) {
        self.enqueue(Command::AddressChanged);
    }

    /// An active DHT node was seen, e.g. in a Gnutella handshake.
    pub fn add_active_node(&self, addr: SocketAddr) {
        self.enqueue(Command::AddActiveNode(addr));
    }

    /// A passive DHT node was seen. It may know active nodes.
    pub fn add_passive_node(&self, addr: SocketAddr) {
        self.enqueue(Command::AddPassiveNode(addr));
    }

    /// Answer to [`GnutellaHost::send_dht_hosts_request`](crate::GnutellaHost::send_dht_hosts_request).
    pub fn handle_dht_hosts(&self, hosts: Vec<DhtHost>) {
        self.enqueue(Command::DhtHosts(hosts));
    }

    /// Contacts an ultrapeer pushed to this leaf.
    pub fn handle_dht_contacts(&self, contacts: Vec<Contact>) {
        self.enqueue(Command::DhtContacts(contacts));
    }

    /// Look up the values stored under `key`.
    ///
    /// Fails right away with `NotRunning` when no controller runs. Otherwise the lookup runs in
    /// the background and the returned future resolves to its outcome.
    pub async fn get(&self, key: NodeId) -> Result<DhtFuture<Vec<Value>>, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Get(key, tx), rx).await?
    }

    /// Store a value created by this node and publish it to the closest nodes. The future
    /// resolves to the contacts that accepted it.
    pub async fn put(&self, value: Value) -> Result<DhtFuture<Vec<Contact>>, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Put(value, tx), rx).await?
    }

    /// Withdraw the local value under `key`. The future resolves to whether there was one.
    pub async fn remove(&self, key: NodeId) -> Result<DhtFuture<bool>, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Remove(key, tx), rx).await?
    }

    /// Up to `max` active DHT nodes to share with Gnutella peers. Empty unless running in active
    /// mode.
    pub async fn active_nodes(&self, max: usize) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::ActiveNodes(max, tx), rx)
            .await
            .unwrap_or_default()
    }

    /// The contact the running controller answers as. Its instance id grows with every restart
    /// under the same id.
    pub async fn local_contact(&self) -> Option<Contact> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::LocalContact(tx), rx)
            .await
            .ok()
            .flatten()
    }

    /// Receive the lifecycle events of every controller from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DhtEvent> {
        self.events.subscribe()
    }

    pub fn mode(&self) -> Mode {
        self.status.lock().unwrap().mode
    }

    pub fn state(&self) -> ControllerState {
        self.status.lock().unwrap().state()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ControllerState::Running(_))
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.state() == ControllerState::Running(BootstrapState::Bootstrapped)
    }

    pub fn is_waiting_for_nodes(&self) -> bool {
        self.state() == ControllerState::Running(BootstrapState::Waiting)
    }

    /// Waits until the running controller is bootstrapped, or returns immediately if it already
    /// is. Returns false when no controller runs, it stops first or the timeout expires.
    pub async fn bootstrapped(&self, timeout: Option<Duration>) -> bool {
        let bootstrap = self.status.lock().unwrap().bootstrap.clone();
        let mut bootstrap = match bootstrap {
            Some(bootstrap) => bootstrap,
            None => return false,
        };

        let wait = async move {
            loop {
                if *bootstrap.borrow_and_update() == BootstrapState::Bootstrapped {
                    return true;
                }

                if bootstrap.changed().await.is_err() {
                    return false;
                }
            }
        };

        match timeout {
            Some(timeout) => time::timeout(timeout, wait).await.unwrap_or(false),
            None => wait.await,
        }
    }

    fn enqueue(&self, command: Command) {
        if self.send.send(command).is_err() {
            log::error!("DHT manager has shut down");
        }
    }

    async fn request<T>(&self, command: Command, rx: oneshot::Receiver<T>) -> Result<T, DhtError> {
        self.send.send(command).map_err(|_| DhtError::NotRunning)?;
        rx.await.map_err(|_| DhtError::NotRunning)
    }
}

struct ManagerWorker {
    controller: Controller,
    // Mode to return to when connectivity comes back.
    wanted: Mode,
    ctx: Arc<Context>,
    status: Arc<Mutex<Status>>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    collisions: mpsc::UnboundedReceiver<Mode>,
}

impl ManagerWorker {
    async fn run(mut self) {
        loop {
            select! {
                command = self.command_rx.recv() => {
                    if let Some(command) = command {
                        self.handle_command(command).await
                    } else {
                        break;
                    }
                }
                Some(mode) = self.collisions.recv() => self.handle_collision(mode).await,
            }
        }

        self.stop_controller().await;
        log::info!("DHT manager shut down");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(mode, done) => {
                self.wanted = mode;
                self.switch(mode).await;
                done.send(()).ok();
            }
            Command::Stop(done) => {
                self.stop_controller().await;
                done.send(()).ok();
            }
            Command::ConnectionEvent(event) => self.handle_connection_event(event).await,
            Command::AddressChanged => {
                if self.controller.is_running() {
                    log::info!(
                        "External address changed, restarting {} DHT",
                        self.controller.mode()
                    );
                    self.stop_controller().await;
                    self.start_controller().await;
                }
            }
            Command::AddActiveNode(addr) => self.controller.add_active_node(addr),
            Command::AddPassiveNode(addr) => self.controller.add_passive_node(addr),
            Command::DhtHosts(hosts) => {
                for host in hosts {
                    match host.mode {
                        Mode::Active => self.controller.add_active_node(host.addr),
                        Mode::Passive => self.controller.add_passive_node(host.addr),
                        Mode::PassiveLeaf | Mode::Inactive => (),
                    }
                }
            }
            Command::DhtContacts(contacts) => self.controller.add_contacts(contacts),
            Command::Get(key, tx) => {
                tx.send(self.controller.get(key)).ok();
            }
            Command::Put(value, tx) => {
                tx.send(self.controller.put(value)).ok();
            }
            Command::Remove(key, tx) => {
                tx.send(self.controller.remove(key)).ok();
            }
            Command::ActiveNodes(max, tx) => {
                tx.send(self.controller.active_nodes(max)).ok();
            }
            Command::LocalContact(tx) => {
                tx.send(self.controller.local_contact()).ok();
            }
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                if self.controller.mode() != self.wanted {
                    self.switch(self.wanted).await;
                } else if !self.controller.is_running() {
                    self.start_controller().await;
                }
            }
            ConnectionEvent::Disconnected | ConnectionEvent::NoInternet => {
                if !self.ctx.config.force_connect {
                    log::info!("Lost connectivity, DHT goes inactive");
                    self.switch(Mode::Inactive).await;
                }
            }
            ConnectionEvent::UltrapeerConnected(_) | ConnectionEvent::UltrapeerDisconnected(_) => {
                self.controller.handle_connection_event(&event)
            }
        }
    }

    async fn handle_collision(&mut self, mode: Mode) {
        // The session that reported it may be gone already.
        if self.controller.mode() != mode || !self.controller.collided() {
            return;
        }

        log::warn!("{} DHT node id collision, restarting with a new id", mode);
        self.ctx.events.send(DhtEvent::Collision(mode)).ok();

        self.stop_controller().await;
        controller::delete_table(&self.ctx.config, mode).await;
        self.start_controller().await;
    }

    async fn switch(&mut self, mode: Mode) {
        if self.controller.mode() == mode {
            self.start_controller().await;
            return;
        }

        self.stop_controller().await;

        log::info!("Switching DHT mode {} -> {}", self.controller.mode(), mode);
        self.controller = Controller::new(mode, self.ctx.clone());
        self.status.lock().unwrap().mode = mode;

        self.start_controller().await;
    }

    async fn start_controller(&mut self) {
        if self.controller.is_running() {
            return;
        }

        self.set_transition(Some(ControllerState::Starting));
        self.controller.start().await;

        let mut status = self.status.lock().unwrap();
        status.bootstrap = self.controller.subscribe();
        status.transition = None;
    }

    async fn stop_controller(&mut self) {
        if !self.controller.is_running() {
            return;
        }

        self.set_transition(Some(ControllerState::Stopping));
        self.controller.stop().await;

        let mut status = self.status.lock().unwrap();
        status.bootstrap = None;
        status.transition = None;
    }

    fn set_transition(&self, transition: Option<ControllerState>) {
        self.status.lock().unwrap().transition = transition;
    }
}
