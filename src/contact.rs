use crate::{compact, id::NodeId, time};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
    net::SocketAddr,
    time::Duration,
};

/// Freshness timestamp of a contact that must be tried before every other one.
///
/// This is the largest timestamp representable in a bencoded integer.
pub const PRIORITY_TIMESTAMP: u64 = i64::MAX as u64;

/// Four character vendor code packed big-endian into an integer, e.g. `LIME`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Vendor(pub u32);

impl Vendor {
    pub const fn from_code(code: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(code))
    }

    pub fn code(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl Display for Vendor {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for b in self.code() {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            };
            write!(f, "{}", c)?;
        }

        Ok(())
    }
}

impl Debug for Vendor {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Liveness of a contact as far as this node can tell.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub enum ContactState {
    /// Learned second hand (lookup responses, contact batches, persisted tables).
    #[default]
    Unknown,
    /// Recently sent us a message or answered one of ours.
    Alive,
    /// Failed to answer a request.
    Dead,
}

/// A participant of the DHT: its id and where to reach it, plus what we know about its liveness.
///
/// Two contacts are equal when their ids are equal.
#[derive(Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    #[serde(with = "compact::socket_addr")]
    pub addr: SocketAddr,
    pub vendor: Vendor,
    pub version: u16,
    #[serde(with = "flag")]
    pub firewalled: bool,
    /// Incremented each time the owning node rebinds its address.
    pub instance_id: u8,
    /// Milliseconds since the UNIX epoch, or `PRIORITY_TIMESTAMP`.
    #[serde(default)]
    pub last_seen: u64,
    #[serde(skip)]
    state: ContactState,
    #[serde(skip)]
    failures: u32,
}

impl Contact {
    /// Contact that was just heard from directly.
    pub fn alive(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            state: ContactState::Alive,
            last_seen: time::unix_millis(),
            ..Self::unknown(id, addr)
        }
    }

    /// Contact learned from a third party.
    pub fn unknown(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            vendor: Vendor::default(),
            version: 0,
            firewalled: false,
            instance_id: 0,
            last_seen: 0,
            state: ContactState::Unknown,
            failures: 0,
        }
    }

    pub fn with_vendor(mut self, vendor: Vendor, version: u16) -> Self {
        self.vendor = vendor;
        self.version = version;
        self
    }

    pub fn with_firewalled(mut self, firewalled: bool) -> Self {
        self.firewalled = firewalled;
        self
    }

    pub fn state(&self) -> ContactState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == ContactState::Alive
    }

    pub fn is_priority(&self) -> bool {
        self.last_seen == PRIORITY_TIMESTAMP
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a direct sighting: the contact sent us a message or answered one of ours.
    pub fn mark_alive(&mut self) {
        self.state = ContactState::Alive;
        self.failures = 0;
        if !self.is_priority() {
            self.last_seen = time::unix_millis();
        }
    }

    /// Record an unanswered request.
    pub fn mark_failed(&mut self) {
        self.state = ContactState::Dead;
        self.failures = self.failures.saturating_add(1);
    }

    /// Pin the contact to the front of every lookup.
    pub fn set_priority(&mut self) {
        self.last_seen = PRIORITY_TIMESTAMP;
    }

    /// Time since the contact was last seen. Priority contacts never age.
    pub fn age(&self) -> Duration {
        if self.is_priority() {
            return Duration::ZERO;
        }

        Duration::from_millis(time::unix_millis().saturating_sub(self.last_seen))
    }

    /// Merge a fresh sighting of the same node into this entry.
    ///
    /// A priority timestamp survives the update and liveness only ever improves from a sighting.
    pub(crate) fn update(&mut self, newer: &Contact) {
        self.addr = newer.addr;
        self.vendor = newer.vendor;
        self.version = newer.version;
        self.firewalled = newer.firewalled;
        self.instance_id = newer.instance_id;
        self.last_seen = self.last_seen.max(newer.last_seen);

        if newer.state == ContactState::Alive {
            self.state = ContactState::Alive;
            self.failures = 0;
        }
    }

    /// Same node bound again, after an address change or a restart.
    pub(crate) fn rebind(&mut self, addr: SocketAddr) {
        self.addr = addr;
        self.instance_id = self.instance_id.wrapping_add(1);
    }

    /// Forget what the remote side claims about freshness. A contact read off the wire is only as
    /// fresh as our own sightings of it.
    pub(crate) fn from_wire(mut self) -> Self {
        self.last_seen = 0;
        self.state = ContactState::Unknown;
        self.failures = 0;
        self
    }
}

impl Eq for Contact {}

impl PartialEq for Contact {
    fn eq(&self, other: &Contact) -> bool {
        self.id == other.id
    }
}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("vendor", &self.vendor)
            .field("version", &self.version)
            .field("firewalled", &self.firewalled)
            .field("instance_id", &self.instance_id)
            .field("state", &self.state)
            .field("failures", &self.failures)
            .finish()
    }
}

impl Display for Contact {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:x}@{}", self.id, self.addr)
    }
}

// Bencode has no booleans.
mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(u8::from(*value))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let num = u8::deserialize(d)?;
        Ok(num > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn positive_equality_by_id() {
        let id = test::dummy_node_id();
        let a = Contact::alive(id, test::dummy_socket_addr(1));
        let b = Contact::unknown(id, test::dummy_socket_addr(2));

        assert_eq!(a, b);
    }

    #[test]
    fn positive_update_keeps_priority() {
        let id = test::dummy_node_id();
        let mut contact = Contact::unknown(id, test::dummy_socket_addr(1));
        contact.set_priority();

        contact.update(&Contact::alive(id, test::dummy_socket_addr(2)));

        assert!(contact.is_priority());
        assert!(contact.is_alive());
        assert_eq!(contact.addr, test::dummy_socket_addr(2));
        assert_eq!(contact.age(), Duration::ZERO);
    }

    #[test]
    fn positive_update_from_unknown_keeps_state() {
        let id = test::dummy_node_id();
        let mut contact = Contact::unknown(id, test::dummy_socket_addr(1));
        contact.mark_failed();

        contact.update(&Contact::unknown(id, test::dummy_socket_addr(1)));

        assert_eq!(contact.state(), ContactState::Dead);
        assert_eq!(contact.failures(), 1);
    }

    #[test]
    fn positive_rebind_increments_instance() {
        let mut contact = Contact::alive(test::dummy_node_id(), test::dummy_socket_addr(1));
        contact.instance_id = u8::MAX;

        contact.rebind(test::dummy_socket_addr(3));

        assert_eq!(contact.instance_id, 0);
        assert_eq!(contact.addr, test::dummy_socket_addr(3));
    }

    #[test]
    fn positive_vendor_code() {
        let vendor = Vendor::from_code(*b"LIME");

        assert_eq!(vendor.code(), *b"LIME");
        assert_eq!(vendor.to_string(), "LIME");
    }

    #[test]
    fn positive_serialize_skips_liveness() {
        let mut contact = Contact::alive(test::dummy_node_id(), test::dummy_socket_addr(7))
            .with_vendor(Vendor::from_code(*b"LIME"), 3)
            .with_firewalled(true);
        contact.mark_failed();

        let encoded = serde_bencode::to_bytes(&contact).unwrap();
        let decoded: Contact = serde_bencode::from_bytes(&encoded).unwrap();

        assert_eq!(decoded.id, contact.id);
        assert_eq!(decoded.addr, contact.addr);
        assert_eq!(decoded.vendor, contact.vendor);
        assert_eq!(decoded.version, 3);
        assert!(decoded.firewalled);
        assert_eq!(decoded.last_seen, contact.last_seen);
        assert_eq!(decoded.state(), ContactState::Unknown);
        assert_eq!(decoded.failures(), 0);
    }
}
