use super::{load_table, save_table, seeded_table, snapshot, start_address, Context, Session};
use crate::{contact::Contact, mode::Mode};
use std::sync::Arc;

/// Full DHT participant: answers requests for other nodes and hands its contacts out to
/// Gnutella peers.
pub(crate) struct ActiveController {
    ctx: Arc<Context>,
    pub(super) session: Option<Session>,
    // Identity of the last run, reused until a collision.
    last_local: Option<Contact>,
}

impl ActiveController {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            session: None,
            last_local: None,
        }
    }

    pub async fn start(&mut self) {
        if self.session.is_some() {
            return;
        }

        let addr = match start_address(&self.ctx, Mode::Active) {
            Some(addr) => addr,
            None => return,
        };

        let saved = load_table(&self.ctx.config, Mode::Active).await;
        let (table, seeded) = seeded_table(
            &self.ctx.config,
            Mode::Active,
            addr,
            self.last_local.as_ref(),
            saved,
        );

        self.session = Some(Session::start(
            self.ctx.clone(),
            Mode::Active,
            table,
            seeded,
        ));
    }

    /// Stop and save the routing table, unless the local id turned out to be taken.
    pub async fn stop(&mut self) {
        let session = match self.session.take() {
            Some(session) => session,
            None => return,
        };

        let collided = session.collided();
        let dht = session.stop();

        if collided {
            self.last_local = None;
            return;
        }

        self.last_local = Some(dht.local());

        let table = snapshot(&dht.table(), None);
        save_table(&self.ctx.config, Mode::Active, table).await;
    }

    /// The local contact, once bootstrapped, followed by the most recently seen live contacts.
    pub fn active_nodes(&self, max: usize) -> Vec<Contact> {
        let session = match &self.session {
            Some(session) => session,
            None => return Vec::new(),
        };

        let table = session.dht().table();
        let mut nodes = Vec::new();

        if session.is_bootstrapped() {
            nodes.push(table.local().clone());
        }

        nodes.extend(
            table
                .most_recently_seen(max)
                .into_iter()
                .filter(|c| c.is_alive()),
        );
        nodes.truncate(max);
        nodes
    }
}
