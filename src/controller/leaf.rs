use super::{local_contact, start_address, Context, Session};
use crate::{contact::Contact, event::ConnectionEvent, mode::Mode, routing::RoutingTable};
use std::sync::Arc;

/// Leaf behind an ultrapeer. Keeps a small routing table fed by its ultrapeers and never
/// bootstraps on its own.
pub(crate) struct PassiveLeafController {
    ctx: Arc<Context>,
    pub(super) session: Option<Session>,
    last_local: Option<Contact>,
}

impl PassiveLeafController {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            session: None,
            last_local: None,
        }
    }

    pub fn start(&mut self) {
        if self.session.is_some() {
            return;
        }

        let addr = match start_address(&self.ctx, Mode::PassiveLeaf) {
            Some(addr) => addr,
            None => return,
        };

        let config = &self.ctx.config;
        let local = local_contact(config, Mode::PassiveLeaf, addr, self.last_local.as_ref());
        let table = RoutingTable::new_leaf(local, config.table);

        self.session = Some(Session::start(
            self.ctx.clone(),
            Mode::PassiveLeaf,
            table,
            false,
        ));
    }

    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            let dht = session.stop();
            self.last_local = Some(dht.local());
        }
    }

    pub fn handle_connection_event(&self, event: &ConnectionEvent) {
        let session = match &self.session {
            Some(session) => session,
            None => return,
        };

        match event {
            ConnectionEvent::UltrapeerConnected(addr) => session.add_priority_node(*addr),
            ConnectionEvent::UltrapeerDisconnected(addr) => session.remove_node(*addr),
            _ => (),
        }
    }
}
