//! Asks the Gnutella side for DHT hosts while the bootstrapper has none to try.

use crate::{
    bootstrap::BootstrapState,
    config::Config,
    host::{DiscoveryTarget, GnutellaHost},
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::watch,
    task::{self, JoinHandle},
    time::Instant,
};

// Bounds the memory of per-host request times.
const MAX_TRACKED_HOSTS: usize = 256;

pub(crate) struct NodeDiscoveryFeed {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    host: Arc<dyn GnutellaHost>,
    interval: Duration,
    min_interval: Duration,
    state: watch::Receiver<BootstrapState>,
    last_broadcast: Mutex<Option<Instant>>,
    last_targeted: Mutex<HashMap<SocketAddr, Instant>>,
}

impl NodeDiscoveryFeed {
    pub fn new(
        host: Arc<dyn GnutellaHost>,
        config: &Config,
        state: watch::Receiver<BootstrapState>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                host,
                interval: config.discovery_interval.max(config.discovery_min_interval),
                min_interval: config.discovery_min_interval,
                state,
                last_broadcast: Mutex::new(None),
                last_targeted: Mutex::new(HashMap::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start asking connected peers for hosts, right away and then periodically for as long as
    /// the bootstrapper waits.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();

        if worker.as_ref().map_or(false, |w| !w.is_finished()) {
            return;
        }

        *worker = Some(task::spawn(run(self.inner.clone())));
    }

    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }

    /// Ask a single host that advertised DHT support for the hosts it knows.
    pub fn request_from(&self, addr: SocketAddr) {
        let now = Instant::now();
        let mut last = self.inner.last_targeted.lock().unwrap();

        if let Some(at) = last.get(&addr) {
            if now.saturating_duration_since(*at) < self.inner.min_interval {
                log::trace!("Not asking {} for DHT hosts again so soon", addr);
                return;
            }
        }

        if last.len() >= MAX_TRACKED_HOSTS {
            let min_interval = self.inner.min_interval;
            last.retain(|_, at| now.saturating_duration_since(*at) < min_interval);
        }

        last.insert(addr, now);
        drop(last);

        log::debug!("Asking {} for DHT hosts", addr);
        self.inner
            .host
            .send_dht_hosts_request(DiscoveryTarget::Host(addr));
    }
}

impl Drop for NodeDiscoveryFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(inner: Arc<Inner>) {
    let mut interval = crate::time::interval(inner.interval);

    loop {
        interval.tick().await;

        if *inner.state.borrow() != BootstrapState::Waiting {
            log::debug!("No longer waiting for DHT hosts");
            break;
        }

        inner.request_all();
    }
}

impl Inner {
    fn request_all(&self) {
        let now = Instant::now();
        let mut last = self.last_broadcast.lock().unwrap();

        if let Some(at) = *last {
            if now.saturating_duration_since(at) < self.min_interval {
                return;
            }
        }

        *last = Some(now);
        drop(last);

        log::debug!("Asking connected peers for DHT hosts");
        self.host.send_dht_hosts_request(DiscoveryTarget::Connected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::RecordingHost;

    fn config() -> Config {
        Config {
            discovery_interval: Duration::from_millis(20),
            discovery_min_interval: Duration::from_millis(10),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn positive_requests_while_waiting() {
        let host = Arc::new(RecordingHost::default());
        let (_state_tx, state_rx) = watch::channel(BootstrapState::Waiting);
        let feed = NodeDiscoveryFeed::new(host.clone(), &config(), state_rx);

        feed.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        feed.stop();

        let requests = host.discovery_requests();
        assert!(requests.len() >= 2);
        assert!(requests.iter().all(|t| *t == DiscoveryTarget::Connected));
    }

    #[tokio::test]
    async fn negative_stops_once_not_waiting() {
        let host = Arc::new(RecordingHost::default());
        let (_state_tx, state_rx) = watch::channel(BootstrapState::Bootstrapped);
        let feed = NodeDiscoveryFeed::new(host.clone(), &config(), state_rx);

        feed.start();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(host.discovery_requests().is_empty());
    }

    #[tokio::test]
    async fn negative_targeted_requests_rate_limited() {
        let host = Arc::new(RecordingHost::default());
        let (_state_tx, state_rx) = watch::channel(BootstrapState::Waiting);
        let feed = NodeDiscoveryFeed::new(
            host.clone(),
            &Config {
                discovery_min_interval: Duration::from_secs(60),
                ..Config::default()
            },
            state_rx,
        );

        let addr = crate::test::dummy_socket_addr(3);
        feed.request_from(addr);
        feed.request_from(addr);

        assert_eq!(host.discovery_requests(), vec![DiscoveryTarget::Host(addr)]);
    }
}
