use super::{load_table, save_table, seeded_table, snapshot, start_address, Context, Session};
use crate::{contact::Contact, mode::Mode};
use std::sync::Arc;

/// Firewalled ultrapeer: looks things up and publishes, but is never stored in other nodes'
/// routing tables.
pub(crate) struct PassiveController {
    ctx: Arc<Context>,
    pub(super) session: Option<Session>,
    // Identity of the last run, reused until a collision.
    last_local: Option<Contact>,
}

impl PassiveController {
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

        let addr = match start_address(&self.ctx, Mode::Passive) {
            Some(addr) => addr,
            None => return,
        };

        let saved = load_table(&self.ctx.config, Mode::Passive).await;
        let (table, seeded) = seeded_table(
            &self.ctx.config,
            Mode::Passive,
            addr,
            self.last_local.as_ref(),
            saved,
        );

        self.session = Some(Session::start(
            self.ctx.clone(),
            Mode::Passive,
            table,
            seeded,
        ));
    }

    /// Stop and save the most recently seen contacts, unless the local id turned out to be
    /// taken.
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

        let table = snapshot(&dht.table(), Some(self.ctx.config.max_persisted_nodes));
        save_table(&self.ctx.config, Mode::Passive, table).await;
    }
}
