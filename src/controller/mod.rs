//! One controller per DHT mode. A controller owns the running node of its mode, if any, and
//! decides what the mode may do: inactive nodes do nothing, passive nodes do not answer for
//! other nodes' active lists, leaves keep their ultrapeer pinned.

mod active;
mod leaf;
mod passive;
mod session;

use self::{
    active::ActiveController, leaf::PassiveLeafController, passive::PassiveController,
    session::Session,
};
use crate::{
    bootstrap::BootstrapState,
    config::{Config, ROUTE_TABLE_VERSION},
    contact::Contact,
    error::DhtError,
    event::{ConnectionEvent, DhtEvent},
    future::DhtFuture,
    host::GnutellaHost,
    id::NodeId,
    mode::Mode,
    persist::{self, PersistedTable},
    routing::{AddOutcome, RoutingTable},
    storage::PublishPolicy,
    time,
    transport::Transport,
    value::Value,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::{broadcast, mpsc};

/// What every controller needs from the outside.
pub(crate) struct Context {
    pub config: Arc<Config>,
    pub host: Arc<dyn GnutellaHost>,
    pub transport: Arc<dyn Transport>,
    pub policy: Arc<dyn PublishPolicy>,
    pub events: broadcast::Sender<DhtEvent>,
    pub collisions: mpsc::UnboundedSender<Mode>,
}

/// Lifecycle of the current controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControllerState {
    NotRunning,
    Starting,
    Running(BootstrapState),
    Stopping,
}

pub(crate) enum Controller {
    Inactive,
    Active(ActiveController),
    Passive(PassiveController),
    PassiveLeaf(PassiveLeafController),
}

impl Controller {
    pub fn new(mode: Mode, ctx: Arc<Context>) -> Self {
        match mode {
            Mode::Inactive => Self::Inactive,
            Mode::Active => Self::Active(ActiveController::new(ctx)),
            Mode::Passive => Self::Passive(PassiveController::new(ctx)),
            Mode::PassiveLeaf => Self::PassiveLeaf(PassiveLeafController::new(ctx)),
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            Self::Inactive => Mode::Inactive,
            Self::Active(_) => Mode::Active,
            Self::Passive(_) => Mode::Passive,
            Self::PassiveLeaf(_) => Mode::PassiveLeaf,
        }
    }

    /// Start the node of this mode. Does nothing when already running or when the host cannot
    /// run the DHT yet.
    pub async fn start(&mut self) {
        match self {
            Self::Inactive => (),
            Self::Active(c) => c.start().await,
            Self::Passive(c) => c.start().await,
            Self::PassiveLeaf(c) => c.start(),
        }
    }

    pub async fn stop(&mut self) {
        match self {
            Self::Inactive => (),
            Self::Active(c) => c.stop().await,
            Self::Passive(c) => c.stop().await,
            Self::PassiveLeaf(c) => c.stop(),
        }
    }

    fn session(&self) -> Option<&Session> {
        match self {
            Self::Inactive => None,
            Self::Active(c) => c.session.as_ref(),
            Self::Passive(c) => c.session.as_ref(),
            Self::PassiveLeaf(c) => c.session.as_ref(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.session().is_some()
    }

    pub fn state(&self) -> ControllerState {
        match self.session() {
            Some(session) => ControllerState::Running(session.bootstrap_state()),
            None => ControllerState::NotRunning,
        }
    }

    /// Whether the running node stopped bootstrapping because its id is taken.
    pub fn collided(&self) -> bool {
        self.session().map_or(false, |s| s.collided())
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.session().map_or(false, |s| s.is_bootstrapped())
    }

    pub fn is_waiting_for_nodes(&self) -> bool {
        self.session().map_or(false, |s| s.is_waiting_for_nodes())
    }

    pub fn subscribe(&self) -> Option<tokio::sync::watch::Receiver<BootstrapState>> {
        self.session().map(|s| s.subscribe())
    }

    pub fn get(&self, key: NodeId) -> Result<DhtFuture<Vec<Value>>, DhtError> {
        self.with_session(|s| s.get(key))
    }

    pub fn put(&self, value: Value) -> Result<DhtFuture<Vec<Contact>>, DhtError> {
        self.with_session(|s| s.put(value))
    }

    pub fn remove(&self, key: NodeId) -> Result<DhtFuture<bool>, DhtError> {
        self.with_session(|s| s.remove(key))
    }

    fn with_session<T, F>(&self, f: F) -> Result<DhtFuture<T>, DhtError>
    where
        F: FnOnce(&Session) -> DhtFuture<T>,
    {
        match self {
            Self::Inactive => Ok(DhtFuture::failed(DhtError::NotSupported)),
            _ => self.session().map(f).ok_or(DhtError::NotRunning),
        }
    }

    pub fn add_active_node(&self, addr: SocketAddr) {
        if let Some(session) = self.session() {
            session.add_active_node(addr);
        }
    }

    pub fn add_passive_node(&self, addr: SocketAddr) {
        if let Some(session) = self.session() {
            session.add_passive_node(addr);
        }
    }

    pub fn add_contacts(&self, contacts: Vec<Contact>) {
        if let Some(session) = self.session() {
            session.add_contacts(contacts);
        }
    }

    pub fn handle_connection_event(&self, event: &ConnectionEvent) {
        if let Self::PassiveLeaf(c) = self {
            c.handle_connection_event(event);
        }
    }

    /// The contact this node runs as, while running.
    pub fn local_contact(&self) -> Option<Contact> {
        self.session().map(|session| session.dht().local())
    }

    /// Up to `max` live contacts to hand out to Gnutella peers, the local one first. Only
    /// active nodes share their routing table this way.
    pub fn active_nodes(&self, max: usize) -> Vec<Contact> {
        match self {
            Self::Active(c) => c.active_nodes(max),
            _ => Vec::new(),
        }
    }
}

fn persistence_enabled(config: &Config, mode: Mode) -> bool {
    match mode {
        Mode::Active => config.persist_active_table,
        Mode::Passive => config.persist_passive_table,
        Mode::PassiveLeaf | Mode::Inactive => false,
    }
}

/// Routing table of `mode` saved by a previous run, if it is usable.
async fn load_table(config: &Config, mode: Mode) -> Option<PersistedTable> {
    if !persistence_enabled(config, mode) {
        return None;
    }

    let path = persist::table_path(config.settings_dir.as_ref()?, mode)?;
    let min_version = match mode {
        Mode::Active => config.min_active_table_version,
        _ => config.min_passive_table_version,
    };

    match persist::load_async(path, min_version, config.max_contact_age).await {
        Ok(table) => table,
        Err(error) => {
            log::warn!("Discarding persisted {} routing table: {}", mode, error);
            None
        }
    }
}

/// What gets saved of a stopped node's routing table. `limit` caps the number of contacts, most
/// recently seen first.
fn snapshot(table: &RoutingTable, limit: Option<usize>) -> PersistedTable {
    let mut contacts = match limit {
        Some(max) => table.most_recently_seen(max),
        None => table.active_contacts(),
    };

    // Priority is a property of this run only.
    let now = time::unix_millis();
    for contact in contacts.iter_mut().filter(|c| c.is_priority()) {
        contact.last_seen = now;
    }

    PersistedTable {
        format_version: ROUTE_TABLE_VERSION,
        local: table.local().clone(),
        contacts,
    }
}

async fn save_table(config: &Config, mode: Mode, table: PersistedTable) {
    if !persistence_enabled(config, mode) {
        return;
    }

    let path = match config
        .settings_dir
        .as_ref()
        .and_then(|dir| persist::table_path(dir, mode))
    {
        Some(path) => path,
        None => return,
    };

    match persist::save_async(path, table).await {
        Ok(()) => log::debug!("Saved {} routing table", mode),
        Err(error) => log::warn!("Failed to save {} routing table: {}", mode, error),
    }
}

/// Forget the saved table of `mode`, e.g. because its local id collided.
pub(crate) async fn delete_table(config: &Config, mode: Mode) {
    let path = match config
        .settings_dir
        .as_ref()
        .and_then(|dir| persist::table_path(dir, mode))
    {
        Some(path) => path,
        None => return,
    };

    if let Err(error) = persist::delete_async(path).await {
        log::warn!("Failed to delete {} routing table: {}", mode, error);
    }
}

/// Local contact of a node about to start. A saved identity is kept but counts as a new
/// instance bound to `addr`.
fn local_contact(
    config: &Config,
    mode: Mode,
    addr: SocketAddr,
    saved: Option<&Contact>,
) -> Contact {
    let contact = match saved {
        Some(saved) => {
            let mut contact = Contact::alive(saved.id, saved.addr);
            contact.instance_id = saved.instance_id;
            contact.rebind(addr);
            contact
        }
        None => Contact::alive(rand::random(), addr),
    };

    contact
        .with_vendor(config.vendor, config.version)
        .with_firewalled(mode.is_firewalled())
}

/// Routing table for an active or passive node, seeded from the saved one. The identity of the
/// previous run in this process wins over the saved one. Returns whether any saved contact made
/// it into the table.
fn seeded_table(
    config: &Config,
    mode: Mode,
    addr: SocketAddr,
    previous: Option<&Contact>,
    saved: Option<PersistedTable>,
) -> (RoutingTable, bool) {
    let local = local_contact(
        config,
        mode,
        addr,
        previous.or_else(|| saved.as_ref().map(|t| &t.local)),
    );
    let mut table = RoutingTable::new(local, config.table);
    let mut seeded = false;

    for contact in saved.into_iter().flat_map(|t| t.contacts) {
        if table.add(contact) != AddOutcome::Rejected {
            seeded = true;
        }
    }

    if seeded {
        log::debug!("Loaded {} contacts into the {} routing table", table.size(), mode);
    }

    (table, seeded)
}

/// Address the node gets bound to, or `None` when the host cannot run the DHT right now.
fn start_address(ctx: &Context, mode: Mode) -> Option<SocketAddr> {
    if !ctx.config.force_connect && !ctx.host.is_connected() {
        log::debug!("Not starting {} DHT without Gnutella connections", mode);
        return None;
    }

    let addr = ctx.host.external_address();
    if addr.is_none() {
        log::debug!("Not starting {} DHT without an external address", mode);
    }

    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test::{self, RecordingHost},
        transport::memory::MemoryNetwork,
    };
    use std::{env, path::PathBuf, time::Duration};

    fn context(network: &MemoryNetwork, host: Arc<RecordingHost>, dir: Option<PathBuf>) -> Arc<Context> {
        let config = Config {
            rpc_timeout: Duration::from_millis(200),
            settings_dir: dir,
            ..Config::default()
        };

        context_with(network, host, config)
    }

    fn context_with(network: &MemoryNetwork, host: Arc<RecordingHost>, config: Config) -> Arc<Context> {
        let addr = host.external_address().unwrap();
        let (events, _) = broadcast::channel(16);
        let (collisions, _) = mpsc::unbounded_channel();

        Arc::new(Context {
            config: Arc::new(config),
            host,
            transport: Arc::new(network.transport(addr)),
            policy: Arc::new(test::KeepAll),
            events,
            collisions,
        })
    }

    #[tokio::test]
    async fn negative_inactive_is_not_supported() {
        let controller = Controller::Inactive;

        assert!(matches!(
            controller.get(test::dummy_node_id()).unwrap().await,
            Err(DhtError::NotSupported)
        ));
        assert!(controller.active_nodes(10).is_empty());
    }

    #[tokio::test]
    async fn negative_stopped_controller_is_not_running() {
        let network = MemoryNetwork::new();
        let host = Arc::new(RecordingHost::new(test::dummy_socket_addr(1)));
        let controller = Controller::new(Mode::Active, context(&network, host, None));

        assert!(matches!(
            controller.get(test::dummy_node_id()),
            Err(DhtError::NotRunning)
        ));
        assert_eq!(controller.state(), ControllerState::NotRunning);
    }

    #[tokio::test]
    async fn negative_no_start_without_connectivity() {
        let network = MemoryNetwork::new();
        let host = Arc::new(RecordingHost::new(test::dummy_socket_addr(1)));
        host.connected.store(false, std::sync::atomic::Ordering::Relaxed);

        let mut controller = Controller::new(Mode::Active, context(&network, host, None));
        controller.start().await;

        assert!(!controller.is_running());
        assert!(!network.is_bound(&test::dummy_socket_addr(1)));
    }

    #[tokio::test]
    async fn negative_active_nodes_empty_before_bootstrap() {
        let network = MemoryNetwork::new();
        let host = Arc::new(RecordingHost::new(test::dummy_socket_addr(1)));
        let mut controller = Controller::new(Mode::Active, context(&network, host, None));
        controller.start().await;

        assert!(controller.is_running());
        assert!(controller.active_nodes(5).is_empty());

        controller.stop().await;
        assert!(!controller.is_running());
        assert!(!network.is_bound(&test::dummy_socket_addr(1)));
    }

    #[tokio::test]
    async fn positive_leaf_tracks_its_ultrapeer() {
        let network = MemoryNetwork::new();

        let ultrapeer_addr = test::dummy_socket_addr(2);
        let ultrapeer = crate::dht::Dht::new(
            Arc::new(Config::default()),
            RoutingTable::new(
                Contact::alive(test::node_id_with_prefix(0x80), ultrapeer_addr),
                Default::default(),
            ),
            Arc::new(network.transport(ultrapeer_addr)),
        );
        ultrapeer.bind();

        let host = Arc::new(RecordingHost::new(test::dummy_socket_addr(1)));
        let mut controller =
            Controller::new(Mode::PassiveLeaf, context(&network, host.clone(), None));
        controller.start().await;
        assert!(controller.is_bootstrapped());

        controller.handle_connection_event(&ConnectionEvent::UltrapeerConnected(ultrapeer_addr));

        let session = controller.session().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.dht().table().get(&ultrapeer.local_id()).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(session
            .dht()
            .table()
            .get(&ultrapeer.local_id())
            .unwrap()
            .is_priority());

        controller.add_contacts(vec![test::contact(test::node_id_with_prefix(0x40), 3)]);
        assert!(controller
            .session()
            .unwrap()
            .dht()
            .table()
            .contains(&test::node_id_with_prefix(0x40)));

        controller
            .handle_connection_event(&ConnectionEvent::UltrapeerDisconnected(ultrapeer_addr));
        assert!(!controller
            .session()
            .unwrap()
            .dht()
            .table()
            .contains(&ultrapeer.local_id()));

        controller.stop().await;
        assert_eq!(
            host.advertised_modes(),
            vec![Mode::PassiveLeaf, Mode::Inactive]
        );
    }

    #[tokio::test]
    async fn positive_passive_nodes_are_not_shared() {
        let network = MemoryNetwork::new();
        let host = Arc::new(RecordingHost::new(test::dummy_socket_addr(1)));
        let mut controller = Controller::new(Mode::Passive, context(&network, host, None));
        controller.start().await;

        assert!(controller.is_running());
        assert!(controller.active_nodes(5).is_empty());

        controller.stop().await;
    }

    #[tokio::test]
    async fn positive_table_survives_restart() {
        let dir = env::temp_dir().join(format!("gnutella-dht-{:016x}", rand::random::<u64>()));
        let network = MemoryNetwork::new();

        let remote_addr = test::dummy_socket_addr(2);
        let remote = crate::dht::Dht::new(
            Arc::new(Config::default()),
            RoutingTable::new(
                Contact::alive(test::node_id_with_prefix(0x80), remote_addr),
                Default::default(),
            ),
            Arc::new(network.transport(remote_addr)),
        );
        remote.bind();

        let host = Arc::new(RecordingHost::new(test::dummy_socket_addr(1)));
        let ctx = context(&network, host, Some(dir.clone()));

        let mut controller = Controller::new(Mode::Active, ctx.clone());
        controller.start().await;
        controller.add_active_node(remote_addr);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !controller.is_bootstrapped() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let local = controller.active_nodes(1).remove(0);
        controller.stop().await;

        let saved = load_table(&ctx.config, Mode::Active).await.unwrap();
        assert_eq!(saved.local.id, local.id);
        assert!(saved.contacts.iter().any(|c| c.addr == remote_addr));

        let (table, seeded) =
            seeded_table(&ctx.config, Mode::Active, local.addr, None, Some(saved));
        assert!(seeded);
        assert_eq!(table.local_id(), local.id);
        assert_eq!(table.local().instance_id, local.instance_id.wrapping_add(1));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn positive_identity_survives_restart_without_settings_dir() {
        let network = MemoryNetwork::new();
        let host = Arc::new(RecordingHost::new(test::dummy_socket_addr(1)));

        for mode in [Mode::Active, Mode::Passive, Mode::PassiveLeaf] {
            let mut controller = Controller::new(mode, context(&network, host.clone(), None));

            controller.start().await;
            let first = controller.session().unwrap().dht().local();
            controller.stop().await;

            controller.start().await;
            let second = controller.session().unwrap().dht().local();
            controller.stop().await;

            assert_eq!(second.id, first.id, "{}", mode);
            assert_eq!(second.instance_id, first.instance_id.wrapping_add(1), "{}", mode);
            assert_eq!(second.addr, test::dummy_socket_addr(1));
        }
    }

    #[test]
    fn positive_previous_identity_wins_over_saved() {
        let config = Config::default();
        let addr = test::dummy_socket_addr(1);

        let mut previous = Contact::alive(test::node_id_with_prefix(0x10), addr);
        previous.instance_id = 7;
        let saved = PersistedTable {
            format_version: ROUTE_TABLE_VERSION,
            local: Contact::alive(test::node_id_with_prefix(0x20), addr),
            contacts: Vec::new(),
        };

        let (table, seeded) =
            seeded_table(&config, Mode::Active, addr, Some(&previous), Some(saved.clone()));
        assert!(!seeded);
        assert_eq!(table.local_id(), previous.id);
        assert_eq!(table.local().instance_id, 8);

        // An aged-out table still carries the identity.
        let (table, _) = seeded_table(&config, Mode::Active, addr, None, Some(saved));
        assert_eq!(table.local_id(), test::node_id_with_prefix(0x20));
        assert_eq!(table.local().instance_id, 1);
    }

    #[tokio::test]
    async fn positive_ultrapeer_forwards_new_contacts_to_leaves() {
        let leaf_addr = test::dummy_socket_addr(9);

        for mode in [Mode::Active, Mode::Passive] {
            let network = MemoryNetwork::new();
            let host = Arc::new(RecordingHost::new(test::dummy_socket_addr(1)));
            host.ultrapeer.store(true, std::sync::atomic::Ordering::SeqCst);
            host.leaves.lock().unwrap().push(leaf_addr);

            let config = Config {
                contact_push_interval: Duration::from_millis(20),
                ..Config::default()
            };
            let mut controller = Controller::new(mode, context_with(&network, host.clone(), config));
            controller.start().await;

            let session = controller.session().unwrap();
            let local_id = session.dht().local_id();
            let contact = test::contact(test::node_id_with_prefix(0x40), 3);
            session.dht().table().add(contact.clone());

            tokio::time::timeout(Duration::from_secs(5), async {
                while host.sent_contacts().is_empty() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();

            let sent = host.sent_contacts();
            assert!(sent.iter().all(|(leaf, _)| *leaf == leaf_addr), "{}", mode);
            assert!(sent
                .iter()
                .flat_map(|(_, batch)| batch)
                .any(|c| c.id == contact.id));
            assert!(sent
                .iter()
                .flat_map(|(_, batch)| batch)
                .all(|c| c.id != local_id));

            controller.stop().await;
        }
    }

    #[tokio::test]
    async fn negative_non_ultrapeer_forwards_nothing() {
        let network = MemoryNetwork::new();
        let host = Arc::new(RecordingHost::new(test::dummy_socket_addr(1)));
        host.leaves.lock().unwrap().push(test::dummy_socket_addr(9));

        let config = Config {
            contact_push_interval: Duration::from_millis(20),
            ..Config::default()
        };
        let mut controller =
            Controller::new(Mode::Active, context_with(&network, host.clone(), config));
        controller.start().await;

        controller
            .session()
            .unwrap()
            .dht()
            .table()
            .add(test::contact(test::node_id_with_prefix(0x40), 3));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(host.sent_contacts().is_empty());

        controller.stop().await;
    }

    #[tokio::test]
    async fn negative_silent_ultrapeer_is_not_pinned() {
        let network = MemoryNetwork::new();
        let host = Arc::new(RecordingHost::new(test::dummy_socket_addr(1)));
        let mut controller = Controller::new(Mode::PassiveLeaf, context(&network, host, None));
        controller.start().await;

        let silent = test::dummy_socket_addr(7);
        controller.handle_connection_event(&ConnectionEvent::UltrapeerConnected(silent));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let table = controller.session().unwrap().dht().table();
        assert!(table.priority_contacts().is_empty());
        assert!(table.active_contacts().iter().all(|c| c.addr != silent));
        drop(table);

        assert!(controller.is_running());
        controller.stop().await;
    }
}
