//! Moving DHT contacts between the DHT and the Gnutella side.
//!
//! An ultrapeer pushes the contacts its routing table learns about to the passive leaves it
//! serves, and any node pings the contacts the Gnutella side hands it before trusting them.

use crate::{
    config::Config, contact::Contact, dht::Dht, host::GnutellaHost, id::NodeId, lifo::LifoSet,
};
use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    task::{self, JoinHandle},
    time,
};

/// Buffers fresh contacts and periodically forwards them to passive leaves.
pub(crate) struct ContactPusher {
    inner: Arc<PusherInner>,
}

struct PusherInner {
    host: Arc<dyn GnutellaHost>,
    local_id: NodeId,
    interval: Duration,
    batch_size: usize,
    buffer: Mutex<VecDeque<Contact>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ContactPusher {
    pub fn new(host: Arc<dyn GnutellaHost>, config: &Config, local_id: NodeId) -> Self {
        Self {
            inner: Arc::new(PusherInner {
                host,
                local_id,
                interval: config.contact_push_interval,
                batch_size: config.contact_push_batch,
                buffer: Mutex::new(VecDeque::new()),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Remember a contact for the next push. Only the most recent ones are kept.
    pub fn push(&self, contact: Contact) {
        if contact.id == self.inner.local_id || self.inner.batch_size == 0 {
            return;
        }

        {
            let mut buffer = self.inner.buffer.lock().unwrap();
            buffer.retain(|c| c.id != contact.id);
            buffer.push_back(contact);

            while buffer.len() > self.inner.batch_size {
                buffer.pop_front();
            }
        }

        let mut timer = self.inner.timer.lock().unwrap();
        if timer.is_none() {
            *timer = Some(task::spawn(push_loop(self.inner.clone())));
        }
    }

    pub fn stop(&self) {
        if let Some(timer) = self.inner.timer.lock().unwrap().take() {
            timer.abort();
        }

        self.inner.buffer.lock().unwrap().clear();
    }
}

impl Drop for ContactPusher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn push_loop(inner: Arc<PusherInner>) {
    loop {
        time::sleep(inner.interval).await;

        let batch: Vec<_> = {
            // Lock order: timer, then buffer.
            let mut timer = inner.timer.lock().unwrap();
            let mut buffer = inner.buffer.lock().unwrap();

            if buffer.is_empty() {
                timer.take();
                return;
            }

            buffer.drain(..).collect()
        };

        let leaves = inner.host.push_proxy_leaves();
        if leaves.is_empty() {
            continue;
        }

        log::debug!("Pushing {} contacts to {} leaves", batch.len(), leaves.len());

        for leaf in leaves {
            inner.host.send_contacts(leaf, &batch);
        }
    }
}

/// Pings contacts received from the Gnutella side, newest first, one at a time, and adds the
/// ones that answer as priority contacts.
pub(crate) struct ContactSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    dht: Dht,
    interval: Duration,
    addrs: Mutex<LifoSet<SocketAddr>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ContactSink {
    pub fn new(dht: Dht, config: &Config) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                dht,
                interval: config.contact_sink_interval,
                addrs: Mutex::new(LifoSet::new(config.contact_sink_capacity)),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn add(&self, addr: SocketAddr) {
        self.inner.addrs.lock().unwrap().push(addr);

        let mut timer = self.inner.timer.lock().unwrap();
        if timer.is_none() {
            *timer = Some(task::spawn(sink_loop(self.inner.clone())));
        }
    }

    pub fn stop(&self) {
        if let Some(timer) = self.inner.timer.lock().unwrap().take() {
            timer.abort();
        }

        self.inner.addrs.lock().unwrap().clear();
    }
}

impl Drop for ContactSink {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sink_loop(inner: Arc<SinkInner>) {
    loop {
        time::sleep(inner.interval).await;

        let addr = {
            let mut timer = inner.timer.lock().unwrap();
            match inner.addrs.lock().unwrap().pop() {
                Some(addr) => addr,
                None => {
                    timer.take();
                    return;
                }
            }
        };

        match inner.dht.ping(addr).await {
            Ok(contact) if contact.firewalled => {
                log::trace!("Dropping {}: firewalled", contact);
            }
            Ok(contact) => {
                log::debug!("Adding {} as priority contact", contact);
                inner.dht.table().add_priority(contact);
            }
            Err(error) => log::trace!("Dropping {}: {}", addr, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        routing::{RoutingTable, TableSettings},
        test::{self, RecordingHost},
        transport::memory::MemoryNetwork,
    };

    fn config() -> Config {
        Config {
            contact_push_interval: Duration::from_millis(20),
            contact_push_batch: 3,
            contact_sink_interval: Duration::from_millis(10),
            rpc_timeout: Duration::from_millis(200),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn positive_pushes_recent_contacts_to_leaves() {
        let host = Arc::new(RecordingHost::default());
        let leaf = test::dummy_socket_addr(100);
        host.leaves.lock().unwrap().push(leaf);

        let local_id = test::node_id_with_prefix(0x01);
        let pusher = ContactPusher::new(host.clone(), &config(), local_id);

        for i in 1..=5u16 {
            pusher.push(test::contact(test::node_id_with_prefix(0x10 + i as u8), i));
        }
        pusher.push(test::contact(local_id, 50));

        time::sleep(Duration::from_millis(100)).await;

        let sent = host.sent_contacts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, leaf);

        let ids: Vec<_> = sent[0].1.iter().map(|c| c.id).collect();
        assert_eq!(
            ids,
            vec![
                test::node_id_with_prefix(0x13),
                test::node_id_with_prefix(0x14),
                test::node_id_with_prefix(0x15),
            ]
        );

        // The timer stops itself once the buffer is empty.
        assert!(pusher.inner.timer.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn negative_stop_discards_buffer() {
        let host = Arc::new(RecordingHost::default());
        host.leaves.lock().unwrap().push(test::dummy_socket_addr(100));

        let pusher = ContactPusher::new(host.clone(), &config(), test::dummy_node_id());
        pusher.push(test::contact(test::node_id_with_prefix(0x10), 1));
        pusher.stop();

        time::sleep(Duration::from_millis(60)).await;
        assert!(host.sent_contacts().is_empty());
    }

    #[tokio::test]
    async fn positive_sink_adds_priority_contact() {
        let network = MemoryNetwork::new();
        let nodes: Vec<_> = [(0x10u8, 1u16), (0x80, 2)]
            .iter()
            .map(|(prefix, index)| {
                let addr = test::dummy_socket_addr(*index);
                let local = Contact::alive(test::node_id_with_prefix(*prefix), addr);
                let dht = Dht::new(
                    Arc::new(config()),
                    RoutingTable::new(local, TableSettings::default()),
                    Arc::new(network.transport(addr)),
                );
                dht.bind();
                dht
            })
            .collect();

        let sink = ContactSink::new(nodes[0].clone(), &config());
        sink.add(test::dummy_socket_addr(7));
        sink.add(test::dummy_socket_addr(2));

        time::timeout(Duration::from_secs(5), async {
            while sink.inner.timer.lock().unwrap().is_some() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let contact = nodes[0].table().get(&nodes[1].local_id()).unwrap();
        assert!(contact.is_priority());
        assert_eq!(nodes[0].table().size(), 1);
    }
}
