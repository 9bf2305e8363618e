use super::classful::NetworkClass;
use crate::{contact::Contact, id::NodeId};
use std::slice::Iter;

/// Bucket containing contacts with identical bit prefixes, plus a replacement cache of contacts
/// that did not fit.
///
/// A bucket at index `depth` of the table holds contacts sharing exactly `depth` leading bits with
/// the local id, except the last bucket which holds everything sharing at least `depth` bits.
#[derive(Clone, Debug)]
pub struct Bucket {
    depth: usize,
    contacts: Vec<Contact>,
    // Oldest sighting first.
    cache: Vec<Contact>,
}

impl Bucket {
    pub(crate) fn new(depth: usize) -> Bucket {
        Bucket {
            depth,
            contacts: Vec::new(),
            cache: Vec::new(),
        }
    }

    /// Number of leading bits this bucket's contacts share with the local id.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Iterator over the active contacts.
    pub fn iter(&self) -> Iter<Contact> {
        self.contacts.iter()
    }

    /// Iterator over the replacement cache.
    pub fn cached(&self) -> Iter<Contact> {
        self.cache.iter()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub(crate) fn get(&self, id: &NodeId) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id == *id)
    }

    pub(crate) fn get_mut(&mut self, id: &NodeId) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| c.id == *id)
    }

    pub(crate) fn insert(&mut self, contact: Contact) {
        self.cache.retain(|c| c.id != contact.id);
        self.contacts.push(contact);
    }

    pub(crate) fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let index = self.contacts.iter().position(|c| c.id == *id)?;
        Some(self.contacts.remove(index))
    }

    pub(crate) fn remove_cached(&mut self, id: &NodeId) -> Option<Contact> {
        let index = self.cache.iter().position(|c| c.id == *id)?;
        Some(self.cache.remove(index))
    }

    /// Number of active contacts living in `class`.
    pub(crate) fn class_count(&self, class: NetworkClass) -> usize {
        self.contacts
            .iter()
            .filter(|c| NetworkClass::of(&c.addr) == class)
            .count()
    }

    /// Put the contact into the replacement cache as its most recent sighting, evicting the oldest
    /// entry when the cache exceeds `max_size`.
    pub(crate) fn offer_to_cache(&mut self, contact: Contact, max_size: usize) {
        if max_size == 0 {
            return;
        }

        match self.cache.iter().position(|c| c.id == contact.id) {
            Some(index) => {
                let mut existing = self.cache.remove(index);
                existing.update(&contact);
                self.cache.push(existing);
            }
            None => self.cache.push(contact),
        }

        if self.cache.len() > max_size {
            let excess = self.cache.len() - max_size;
            self.cache.drain(..excess);
        }
    }

    /// Take the most recently seen cached contact, skipping those whose network already has
    /// `class_limit` active contacts when a limit applies.
    pub(crate) fn take_replacement(&mut self, class_limit: Option<usize>) -> Option<Contact> {
        let index = self
            .cache
            .iter()
            .enumerate()
            .filter(|(_, c)| match class_limit {
                Some(limit) => self.class_count(NetworkClass::of(&c.addr)) < limit,
                None => true,
            })
            .max_by_key(|(index, c)| (c.last_seen, *index))
            .map(|(index, _)| index)?;

        Some(self.cache.remove(index))
    }

    /// Drop every active and cached contact `stale` says should go. Returns the removed active
    /// contacts.
    pub(crate) fn retain_fresh<F>(&mut self, stale: F) -> Vec<Contact>
    where
        F: Fn(&Contact) -> bool,
    {
        self.cache.retain(|c| !stale(c));

        let (removed, kept): (Vec<_>, Vec<_>) = self.contacts.drain(..).partition(|c| stale(c));
        self.contacts = kept;
        removed
    }

    pub(crate) fn take_all(self) -> (Vec<Contact>, Vec<Contact>) {
        (self.contacts, self.cache)
    }
}

// ----------------------------------------------------------------------------//
