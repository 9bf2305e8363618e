use super::{bucket::Bucket, classful::NetworkClass};
use crate::{
    contact::Contact,
    id::{NodeId, NODE_ID_BITS},
};
use std::time::Duration;
use tokio::sync::mpsc;

pub const MAX_BUCKETS: usize = NODE_ID_BITS;

/// Size limits of a routing table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TableSettings {
    /// Maximum number of active contacts per bucket (K).
    pub bucket_size: usize,
    /// Maximum number of replacement contacts per bucket.
    pub max_cache_size: usize,
    /// Maximum number of contacts from one /24 (IPv4) or /48 (IPv6) network in a bucket that can
    /// no longer split.
    pub class_c_limit: usize,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            bucket_size: 20,
            max_cache_size: 16,
            class_c_limit: 10,
        }
    }
}

/// Shape of the routing table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TableKind {
    /// Kademlia table that splits the bucket holding the local id.
    Full,
    /// Single bucket that never splits. The local contact is part of every answer.
    Leaf,
}

/// What `RoutingTable::add` did with a contact.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Updated,
    Cached,
    Rejected,
}

/// Structural change of a routing table.
#[derive(Clone, Debug)]
pub enum RouteTableEvent {
    ContactAdded(Contact),
    ContactUpdated(Contact),
    ContactCached(Contact),
    ContactRemoved(Contact),
    BucketSplit { depth: usize },
}

/// Routing table containing buckets of contacts as well as the local contact participating in
/// the dht.
pub struct RoutingTable {
    kind: TableKind,
    // Important: the local id always falls within the range of the last bucket.
    buckets: Vec<Bucket>,
    local: Contact,
    settings: TableSettings,
    listeners: Vec<mpsc::UnboundedSender<RouteTableEvent>>,
}

impl RoutingTable {
    /// Create a full Kademlia table around the local contact.
    pub fn new(local: Contact, settings: TableSettings) -> RoutingTable {
        Self::with_kind(TableKind::Full, local, settings)
    }

    /// Create a single-bucket table for a passive leaf.
    pub fn new_leaf(local: Contact, settings: TableSettings) -> RoutingTable {
        Self::with_kind(TableKind::Leaf, local, settings)
    }

    fn with_kind(kind: TableKind, local: Contact, settings: TableSettings) -> RoutingTable {
        RoutingTable {
            kind,
            buckets: vec![Bucket::new(0)],
            local,
            settings,
            listeners: Vec::new(),
        }
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn settings(&self) -> &TableSettings {
        &self.settings
    }

    pub fn local(&self) -> &Contact {
        &self.local
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    /// Replace the local contact, e.g. after the host's address changed. The id must not change.
    pub fn set_local(&mut self, local: Contact) {
        debug_assert_eq!(local.id, self.local.id);
        self.local = local;
    }

    /// Register a listener for structural changes. Sending never blocks; listeners whose receiver
    /// was dropped are forgotten.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RouteTableEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    /// Iterator over all buckets in the routing table.
    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> + ExactSizeIterator {
        self.buckets.iter()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of contacts in the table. A leaf table counts the local contact too.
    pub fn size(&self) -> usize {
        let active: usize = self.buckets.iter().map(Bucket::len).sum();

        match self.kind {
            TableKind::Full => active,
            TableKind::Leaf => active + 1,
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.buckets[self.bucket_index(id)].get(id).is_some()
    }

    /// Find the contact with the given id. Asking for the local id yields the local contact.
    pub fn get(&self, id: &NodeId) -> Option<Contact> {
        if *id == self.local.id {
            return Some(self.local.clone());
        }

        self.buckets[self.bucket_index(id)].get(id).cloned()
    }

    /// Active contacts. A leaf table includes the local contact.
    pub fn active_contacts(&self) -> Vec<Contact> {
        let mut contacts: Vec<_> = self.buckets.iter().flat_map(Bucket::iter).cloned().collect();

        if self.kind == TableKind::Leaf {
            contacts.push(self.local.clone());
        }

        contacts
    }

    pub fn cached_contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(Bucket::cached)
            .cloned()
            .collect()
    }

    /// Up to `count` active contacts, most recently seen first.
    pub fn most_recently_seen(&self, count: usize) -> Vec<Contact> {
        let mut contacts: Vec<_> = self.buckets.iter().flat_map(Bucket::iter).cloned().collect();
        contacts.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        contacts.truncate(count);
        contacts
    }

    /// Up to `count` contacts closest to `target`, by ascending XOR distance.
    pub fn select(&self, target: &NodeId, count: usize, alive_only: bool) -> Vec<Contact> {
        let mut candidates: Vec<_> = self
            .buckets
            .iter()
            .flat_map(Bucket::iter)
            .filter(|c| !alive_only || c.is_alive())
            .cloned()
            .collect();

        if self.kind == TableKind::Leaf {
            candidates.push(self.local.clone());
        }

        candidates.sort_by_key(|c| target.distance(&c.id));
        candidates.truncate(count);
        candidates
    }

    /// Random ids aimed at every bucket but the one holding the local id. Looking them up fills
    /// the far buckets.
    pub fn refresh_targets(&self) -> Vec<NodeId> {
        if self.kind == TableKind::Leaf {
            return Vec::new();
        }

        (0..self.buckets.len() - 1)
            .map(|depth| self.local.id.random_with_shared_prefix(depth))
            .collect()
    }

    /// Add the contact to the table, split the local bucket if needed, or keep it as a
    /// replacement.
    pub fn add(&mut self, contact: Contact) -> AddOutcome {
        if contact.id == self.local.id {
            return AddOutcome::Rejected;
        }

        // Firewalled nodes cannot be reached by others, which is also how passive nodes keep out
        // of everyone's table.
        if contact.firewalled {
            log::trace!("Not adding firewalled contact {}", contact);
            return AddOutcome::Rejected;
        }

        let index = self.bucket_index(&contact.id);

        if let Some(existing) = self.buckets[index].get_mut(&contact.id) {
            existing.update(&contact);
            let updated = existing.clone();
            self.emit(RouteTableEvent::ContactUpdated(updated));
            return AddOutcome::Updated;
        }

        let splittable = self.can_split(index);

        if !splittable {
            let class = NetworkClass::of(&contact.addr);
            if self.buckets[index].class_count(class) >= self.settings.class_c_limit {
                log::debug!(
                    "Rejecting {}: bucket {} already holds {} contacts of its network",
                    contact,
                    index,
                    self.settings.class_c_limit
                );
                return AddOutcome::Rejected;
            }
        }

        if self.buckets[index].len() < self.settings.bucket_size {
            self.buckets[index].insert(contact.clone());
            self.emit(RouteTableEvent::ContactAdded(contact));
            return AddOutcome::Added;
        }

        if splittable && self.split(index) {
            return self.add(contact);
        }

        self.buckets[index].offer_to_cache(contact.clone(), self.settings.max_cache_size);
        self.emit(RouteTableEvent::ContactCached(contact));
        AddOutcome::Cached
    }

    /// Add a contact that must be preferred over every other one in the first hop of lookups.
    ///
    /// Unlike `add`, firewalled contacts are accepted (a leaf's ultrapeer may run a passive node)
    /// and a full bucket that cannot split makes room by moving its least recently seen ordinary
    /// contact to the replacement cache.
    pub fn add_priority(&mut self, mut contact: Contact) -> AddOutcome {
        if contact.id == self.local.id {
            return AddOutcome::Rejected;
        }

        contact.set_priority();
        let index = self.bucket_index(&contact.id);

        if let Some(existing) = self.buckets[index].get_mut(&contact.id) {
            existing.update(&contact);
            let updated = existing.clone();
            self.emit(RouteTableEvent::ContactUpdated(updated));
            return AddOutcome::Updated;
        }

        if self.buckets[index].len() >= self.settings.bucket_size {
            if self.split(index) {
                return self.add_priority(contact);
            }

            let bucket = &mut self.buckets[index];
            let victim = bucket
                .iter()
                .filter(|c| !c.is_priority())
                .min_by_key(|c| c.last_seen)
                .map(|c| c.id);

            let displaced = match victim.and_then(|id| bucket.remove(&id)) {
                Some(displaced) => displaced,
                None => return AddOutcome::Rejected,
            };

            log::debug!("Moving {} to the replacement cache to make room for {}", displaced, contact);
            bucket.offer_to_cache(displaced.clone(), self.settings.max_cache_size);
            self.emit(RouteTableEvent::ContactCached(displaced));
        }

        self.buckets[index].insert(contact.clone());
        self.emit(RouteTableEvent::ContactAdded(contact));
        AddOutcome::Added
    }

    /// Every priority contact, however far from any target.
    pub fn priority_contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(Bucket::iter)
            .filter(|c| c.is_priority())
            .cloned()
            .collect()
    }

    /// Tries to split the bucket at the specified index.
    ///
    /// Returns false if the split cannot be performed, which is always the case for a leaf table.
    pub fn split(&mut self, bucket_index: usize) -> bool {
        if !self.can_split(bucket_index) {
            return false;
        }

        let split_bucket = match self.buckets.pop() {
            Some(bucket) => bucket,
            None => return false,
        };

        let depth = split_bucket.depth();

        // The far half keeps the depth, the near half covers the local id.
        self.buckets.push(Bucket::new(depth));
        self.buckets.push(Bucket::new(depth + 1));

        let (contacts, cache) = split_bucket.take_all();

        for contact in contacts {
            let index = self.bucket_index(&contact.id);
            self.buckets[index].insert(contact);
        }

        for contact in cache {
            let index = self.bucket_index(&contact.id);
            self.buckets[index].offer_to_cache(contact, self.settings.max_cache_size);
        }

        log::debug!(
            "Split bucket {}, table now has {} buckets",
            depth,
            self.buckets.len()
        );

        self.emit(RouteTableEvent::BucketSplit { depth });
        true
    }

    /// A request to the contact failed. Removes it and promotes the most recently seen
    /// replacement of its bucket.
    ///
    /// Returns false if no contact with this id and address is known. The priority contact of a
    /// leaf table is only marked as failed.
    pub fn handle_failure(&mut self, id: &NodeId, addr: &std::net::SocketAddr) -> bool {
        let index = self.bucket_index(id);
        let class_limit = self.class_limit(index);
        let leaf = self.kind == TableKind::Leaf;
        let bucket = &mut self.buckets[index];

        let known = bucket.get(id).map(|c| (c.addr == *addr, c.is_priority()));

        let (removed, replacement) = match known {
            Some((false, _)) => return false,
            Some((true, true)) if leaf => {
                if let Some(contact) = bucket.get_mut(id) {
                    contact.mark_failed();
                }
                return true;
            }
            Some(_) => {
                let mut removed = match bucket.remove(id) {
                    Some(removed) => removed,
                    None => return false,
                };
                removed.mark_failed();

                let replacement = bucket.take_replacement(class_limit);
                if let Some(replacement) = &replacement {
                    bucket.insert(replacement.clone());
                }

                (removed, replacement)
            }
            None => return bucket.remove_cached(id).is_some(),
        };

        log::debug!("Removed failed contact {}", removed);
        self.emit(RouteTableEvent::ContactRemoved(removed));

        if let Some(replacement) = replacement {
            log::debug!("Promoted replacement contact {}", replacement);
            self.emit(RouteTableEvent::ContactAdded(replacement));
        }

        true
    }

    /// Drop a contact whatever its state, promoting a replacement into its place.
    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let index = self.bucket_index(id);
        let class_limit = self.class_limit(index);
        let bucket = &mut self.buckets[index];

        let removed = bucket.remove(id)?;
        let replacement = bucket.take_replacement(class_limit);
        if let Some(replacement) = &replacement {
            bucket.insert(replacement.clone());
        }

        self.emit(RouteTableEvent::ContactRemoved(removed.clone()));
        if let Some(replacement) = replacement {
            self.emit(RouteTableEvent::ContactAdded(replacement));
        }

        Some(removed)
    }

    /// Drop contacts not seen for longer than `max_age`, refilling buckets from their caches.
    /// Returns the number of active contacts removed.
    pub fn purge(&mut self, max_age: Duration) -> usize {
        let mut removed_total = 0;

        for index in 0..self.buckets.len() {
            let class_limit = self.class_limit(index);
            let bucket_size = self.settings.bucket_size;
            let bucket = &mut self.buckets[index];

            let removed = bucket.retain_fresh(|c| !c.is_priority() && c.age() > max_age);

            let mut promoted = Vec::new();
            while bucket.len() < bucket_size {
                match bucket.take_replacement(class_limit) {
                    Some(contact) => {
                        bucket.insert(contact.clone());
                        promoted.push(contact);
                    }
                    None => break,
                }
            }

            removed_total += removed.len();

            for contact in removed {
                self.emit(RouteTableEvent::ContactRemoved(contact));
            }

            for contact in promoted {
                self.emit(RouteTableEvent::ContactAdded(contact));
            }
        }

        removed_total
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        bucket_placement(leading_bit_count(self.local.id, *id), self.buckets.len())
    }

    /// Returns true if the bucket can be split.
    fn can_split(&self, bucket_index: usize) -> bool {
        self.kind == TableKind::Full
            && bucket_index == self.buckets.len() - 1
            && self.buckets.len() < MAX_BUCKETS
    }

    fn class_limit(&self, bucket_index: usize) -> Option<usize> {
        if self.can_split(bucket_index) {
            None
        } else {
            Some(self.settings.class_c_limit)
        }
    }

    fn emit(&mut self, event: RouteTableEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Number of leading bits that are identical between the local and remote node ids.
pub fn leading_bit_count(local_node: NodeId, remote_node: NodeId) -> usize {
    (local_node ^ remote_node).leading_zeros() as usize
}

/// Take the number of leading bits that are the same between our node and the remote
/// node and calculate a bucket index for that node id.
fn bucket_placement(num_same_bits: usize, num_buckets: usize) -> usize {
    // The index that the node should be placed in *eventually*, meaning
    // when we create enough buckets for that bucket to appear.
    let ideal_index = num_same_bits;

    if ideal_index >= num_buckets {
        num_buckets - 1
    } else {
        ideal_index
    }
}

// ----------------------------------------------------------------------------//
