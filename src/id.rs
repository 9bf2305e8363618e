use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::{
    convert::{TryFrom, TryInto},
    fmt,
    ops::BitXor,
};
use thiserror::Error;

/// Length of a `NodeId` in bytes.
pub const NODE_ID_LEN: usize = 20;

/// Number of bits in a `NodeId`.
pub const NODE_ID_BITS: usize = NODE_ID_LEN * 8;

/// Point in the 160-bit Kademlia key space. Identifies both nodes and values.
///
/// Ids have no meaningful order on their own. Closeness is measured by the XOR of two ids, which is
/// itself a `NodeId` whose big-endian byte order gives the distance order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct NodeId([u8; NODE_ID_LEN]);

/// XOR distance between two ids. Compares big-endian.
pub type Distance = NodeId;

impl NodeId {
    /// Id with every bit cleared.
    pub const MIN: Self = Self([0; NODE_ID_LEN]);

    /// Create a NodeId by hashing the given bytes using SHA-1.
    pub fn sha1(bytes: &[u8]) -> Self {
        let hash = Sha1::digest(bytes);
        Self(hash.into())
    }

    /// Copy of this id with the bit at `index` inverted, counting from the most significant
    /// bit. Panics if `index >= NODE_ID_BITS`.
    pub fn flip_bit(self, index: usize) -> Self {
        let mut bytes = self.0;
        bytes[index / 8] ^= bit_mask(index);
        Self(bytes)
    }

    /// Value of the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & bit_mask(index) != 0
    }

    /// Number of leading zero bits, i.e. the length of the prefix shared with `NodeId::MIN`.
    pub fn leading_zeros(&self) -> u32 {
        match self.0.iter().position(|byte| *byte != 0) {
            Some(index) => index as u32 * 8 + self.0[index].leading_zeros(),
            None => NODE_ID_BITS as u32,
        }
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &NodeId) -> Distance {
        *self ^ *other
    }

    /// Random id that shares exactly `prefix_len` leading bits with `self`.
    ///
    /// Used to aim refresh lookups into a particular bucket. `prefix_len` must be less than
    /// `NODE_ID_BITS`.
    pub fn random_with_shared_prefix(&self, prefix_len: usize) -> Self {
        let random: NodeId = rand::random();
        let mut bytes = random.0;

        for index in 0..prefix_len {
            let mask = bit_mask(index);
            let byte = &mut bytes[index / 8];
            *byte = (*byte & !mask) | (self.0[index / 8] & mask);
        }

        let id = NodeId(bytes);
        if id.bit(prefix_len) == self.bit(prefix_len) {
            id.flip_bit(prefix_len)
        } else {
            id
        }
    }
}

fn bit_mask(index: usize) -> u8 {
    0x80 >> (index % 8)
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<NodeId> for [u8; NODE_ID_LEN] {
    fn from(id: NodeId) -> [u8; NODE_ID_LEN] {
        id.0
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> NodeId {
        Self(bytes)
    }
}

#[derive(Debug, Error)]
#[error("invalid node id length")]
pub struct LengthError;

impl<'a> TryFrom<&'a [u8]> for NodeId {
    type Error = LengthError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into().map_err(|_| LengthError)?))
    }
}

impl BitXor for NodeId {
    type Output = Self;

    fn bitxor(self, rhs: Self) -> Self {
        Self(std::array::from_fn(|index| self.0[index] ^ rhs.0[index]))
    }
}

impl Distribution<NodeId> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> NodeId {
        NodeId(rng.gen())
    }
}

impl fmt::LowerHex for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(self, f)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// On the wire and on disk an id is a bencoded byte string of exactly `NODE_ID_LEN` bytes.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let buf = ByteBuf::deserialize(d)?;
        Self::try_from(buf.as_slice())
            .map_err(|_| D::Error::invalid_length(buf.len(), &"20 byte node id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_leading_zeros_of_distance() {
        let max = NodeId::from([0xff; NODE_ID_LEN]);

        assert_eq!(NodeId::MIN.distance(&max).leading_zeros(), 0);
        assert_eq!(max.distance(&max).leading_zeros() as usize, NODE_ID_BITS);
        assert_eq!(max.distance(&max.flip_bit(0)).leading_zeros(), 0);
        assert_eq!(max.distance(&max.flip_bit(13)).leading_zeros(), 13);
    }

    #[test]
    fn negative_short_id_is_rejected() {
        let encoded = serde_bencode::to_bytes(&serde_bytes::Bytes::new(&[1, 2, 3])).unwrap();

        assert!(serde_bencode::from_bytes::<NodeId>(&encoded).is_err());
        assert!(NodeId::try_from(&[0u8; 19][..]).is_err());
    }

    #[test]
    fn positive_distance_orders_big_endian() {
        let target = NodeId::MIN;
        let near = NodeId::from(hex_id("00000000000000000000000000000000000000ff"));
        let far = NodeId::from(hex_id("0100000000000000000000000000000000000000"));

        assert!(target.distance(&near) < target.distance(&far));
        assert_eq!(near.distance(&near), NodeId::MIN);
    }

    #[test]
    fn positive_bit_matches_flip_bit() {
        let id = NodeId::MIN.flip_bit(9);

        assert!(id.bit(9));
        assert!(!id.bit(8));
        assert!(!id.bit(10));
    }

    #[test]
    fn positive_random_with_shared_prefix() {
        let local: NodeId = rand::random();

        for prefix_len in [0, 1, 7, 8, 63, NODE_ID_BITS - 1] {
            let id = local.random_with_shared_prefix(prefix_len);
            assert_eq!(local.distance(&id).leading_zeros() as usize, prefix_len);
        }
    }

    #[test]
    fn positive_display_is_lower_hex() {
        let id = NodeId::from(hex_id("0123456789abcdef0123456789abcdef01234567"));

        assert_eq!(id.to_string(), "0123456789abcdef0123456789abcdef01234567");
    }

    fn hex_id(s: &str) -> [u8; NODE_ID_LEN] {
        hex::decode(s).unwrap().try_into().unwrap()
    }
}
