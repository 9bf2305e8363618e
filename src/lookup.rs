//! Iterative Kademlia lookup.

use crate::{
    contact::Contact,
    dht::Dht,
    error::DhtError,
    id::{Distance, NodeId},
    message::{FindNodeRequest, FindValueRequest, Request, Response},
    value::Value,
};
use futures_util::{stream::FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashSet, VecDeque};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum LookupKind {
    /// Find the contacts closest to the target.
    Node,
    /// Find values stored under the target, stopping at the first node that has some.
    Value,
}

#[derive(Default)]
pub(crate) struct LookupOutcome {
    /// Contacts that answered, closest first, at most K of them.
    pub closest: Vec<Contact>,
    pub values: Vec<Value>,
    /// Contacts reported with the local id but another address.
    pub claimants: Vec<Contact>,
}

/// Run a lookup for `target`, seeded from the routing table and `extra_seeds`.
///
/// Priority contacts of the routing table are queried first, then the closest known contacts
/// that have not been queried yet, keeping `lookup_parallelism` requests in flight until the K
/// closest known contacts have all been asked.
pub(crate) async fn run(
    dht: &Dht,
    target: NodeId,
    kind: LookupKind,
    extra_seeds: Vec<Contact>,
) -> LookupOutcome {
    let k = dht.config().table.bucket_size;
    let alpha = dht.config().lookup_parallelism.max(1);
    let local = dht.local();

    let (priority, mut seeds) = {
        let table = dht.table();
        (table.priority_contacts(), table.select(&target, k, false))
    };
    seeds.extend(extra_seeds);
    for contact in priority {
        if seeds.iter().all(|c| c.id != contact.id) {
            seeds.push(contact);
        }
    }
    seeds.retain(|c| c.id != local.id);

    let mut first_hop: VecDeque<Contact> =
        seeds.iter().filter(|c| c.is_priority()).cloned().collect();
    let mut shortlist: BTreeMap<Distance, Contact> = seeds
        .into_iter()
        .map(|c| (target.distance(&c.id), c))
        .collect();

    let mut queried = HashSet::new();
    let mut responded = BTreeMap::new();
    let mut outcome = LookupOutcome::default();
    let mut in_flight = FuturesUnordered::new();

    loop {
        while in_flight.len() < alpha {
            let next = next_candidate(&mut first_hop, &shortlist, &queried, k);
            let contact = match next {
                Some(contact) => contact,
                None => break,
            };

            queried.insert(contact.id);
            in_flight.push(query(dht, contact, request(&local, target, kind)));
        }

        let (contact, result) = match in_flight.next().await {
            Some(next) => next,
            None => break,
        };

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                log::trace!("Lookup for {} skipping {}: {}", target, contact, error);
                shortlist.remove(&target.distance(&contact.id));
                continue;
            }
        };

        responded.insert(target.distance(&contact.id), contact);

        if kind == LookupKind::Value && !response.values.is_empty() {
            collect_values(&mut outcome.values, target, response.values);

            if !outcome.values.is_empty() {
                break;
            }
        }

        for node in response.nodes {
            let node = node.from_wire();

            if node.id == local.id {
                if node.addr != local.addr {
                    outcome.claimants.push(node);
                }
                continue;
            }

            if queried.contains(&node.id) || node.firewalled {
                continue;
            }

            shortlist.entry(target.distance(&node.id)).or_insert(node);
        }
    }

    outcome.closest = responded.into_values().take(k).collect();
    outcome
}

fn next_candidate(
    first_hop: &mut VecDeque<Contact>,
    shortlist: &BTreeMap<Distance, Contact>,
    queried: &HashSet<NodeId>,
    k: usize,
) -> Option<Contact> {
    while let Some(contact) = first_hop.pop_front() {
        if !queried.contains(&contact.id) {
            return Some(contact);
        }
    }

    shortlist
        .values()
        .take(k)
        .find(|c| !queried.contains(&c.id))
        .cloned()
}

fn request(local: &Contact, target: NodeId, kind: LookupKind) -> Request {
    let sender = local.clone();

    match kind {
        LookupKind::Node => Request::FindNode(FindNodeRequest { sender, target }),
        LookupKind::Value => Request::FindValue(FindValueRequest {
            sender,
            key: target,
        }),
    }
}

async fn query(
    dht: &Dht,
    contact: Contact,
    request: Request,
) -> (Contact, Result<Response, DhtError>) {
    let result = dht.request(&contact, request).await;
    (contact, result)
}

fn collect_values(values: &mut Vec<Value>, key: NodeId, received: Vec<Value>) {
    for value in received {
        if value.key != key || value.is_tombstone() {
            continue;
        }

        if let Err(error) = value.validate() {
            log::debug!("Dropping malformed value for {} from {}: {}", key, value.creator, error);
            continue;
        }

        if values.iter().all(|v| v.creator.id != value.creator.id) {
            values.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        routing::{RoutingTable, TableSettings},
        test,
        transport::memory::MemoryNetwork,
        value::AltLoc,
    };
    use std::sync::Arc;

    fn node(network: &MemoryNetwork, id: NodeId, index: u16) -> Dht {
        let addr = test::dummy_socket_addr(index);
        let table = RoutingTable::new(Contact::alive(id, addr), TableSettings::default());
        let dht = Dht::new(
            Arc::new(Config::default()),
            table,
            Arc::new(network.transport(addr)),
        );
        dht.bind();
        dht
    }

    #[tokio::test]
    async fn positive_finds_closest_through_chain() {
        let network = MemoryNetwork::new();
        let a = node(&network, test::node_id_with_prefix(0x00), 1);
        let b = node(&network, test::node_id_with_prefix(0x80), 2);
        let c = node(&network, test::node_id_with_prefix(0xf0), 3);

        // a knows b, b knows c.
        a.ping(test::dummy_socket_addr(2)).await.unwrap();
        b.ping(test::dummy_socket_addr(3)).await.unwrap();

        let target = test::node_id_with_prefix(0xf1);
        let outcome = run(&a, target, LookupKind::Node, Vec::new()).await;

        let ids: Vec<_> = outcome.closest.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![c.local_id(), b.local_id()]);
        assert!(outcome.claimants.is_empty());
        assert!(a.table().contains(&c.local_id()));
    }

    #[tokio::test]
    async fn positive_value_lookup_stops_at_values() {
        let network = MemoryNetwork::new();
        let a = node(&network, test::node_id_with_prefix(0x00), 1);
        let b = node(&network, test::node_id_with_prefix(0x80), 2);
        a.ping(test::dummy_socket_addr(2)).await.unwrap();

        let key = test::node_id_with_prefix(0x81);
        let creator = test::contact(test::node_id_with_prefix(0x40), 9);
        let value = Value::alt_loc(
            key,
            creator,
            &AltLoc {
                guid: [2; 16],
                port: 6346,
                firewall: None,
            },
        );
        b.store()
            .store(value, crate::storage::Origin::Remote)
            .unwrap();

        let outcome = run(&a, key, LookupKind::Value, Vec::new()).await;
        assert_eq!(outcome.values.len(), 1);
    }

    #[tokio::test]
    async fn positive_far_priority_contact_is_asked_first() {
        let network = MemoryNetwork::new();
        let ultrapeer = node(&network, test::node_id_with_prefix(0x80), 2);

        let leaf_addr = test::dummy_socket_addr(1);
        let leaf = Dht::new(
            Arc::new(Config::default()),
            RoutingTable::new_leaf(
                Contact::alive(test::node_id_with_prefix(0x00), leaf_addr),
                TableSettings::default(),
            ),
            Arc::new(network.transport(leaf_addr)),
        );
        leaf.bind();

        leaf.table()
            .add_priority(test::contact(ultrapeer.local_id(), 2));

        // Closer to the target than the ultrapeer, but nobody answers there.
        for index in 0..19u8 {
            leaf.table().add(test::contact(
                test::node_id_with_prefix(0x60 + index),
                100 + index as u16,
            ));
        }

        let target = test::node_id_with_prefix(0x7F);
        assert!(leaf
            .table()
            .select(&target, 20, false)
            .iter()
            .all(|c| c.id != ultrapeer.local_id()));

        let outcome = run(&leaf, target, LookupKind::Node, Vec::new()).await;
        assert!(outcome
            .closest
            .iter()
            .any(|c| c.id == ultrapeer.local_id()));
    }

    #[tokio::test]
    async fn negative_empty_table_finds_nothing() {
        let network = MemoryNetwork::new();
        let a = node(&network, test::node_id_with_prefix(0x00), 1);

        let outcome = run(&a, test::node_id_with_prefix(0x10), LookupKind::Node, Vec::new()).await;
        assert!(outcome.closest.is_empty());
        assert!(outcome.values.is_empty());
    }

    #[test]
    fn negative_malformed_values_are_dropped() {
        let key = test::node_id_with_prefix(0x81);
        let creator = test::contact(test::node_id_with_prefix(0x40), 9);
        let mut bad = Value::alt_loc(
            key,
            creator.clone(),
            &AltLoc {
                guid: [2; 16],
                port: 6346,
                firewall: None,
            },
        );
        bad.payload.truncate(3);
        let other_key = Value::alt_loc(
            test::node_id_with_prefix(0x82),
            creator,
            &AltLoc {
                guid: [2; 16],
                port: 6346,
                firewall: None,
            },
        );

        let mut values = Vec::new();
        collect_values(&mut values, key, vec![bad, other_key]);
        assert!(values.is_empty());
    }
}
