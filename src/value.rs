//! Values stored in the DHT and the binary payloads they carry.

use crate::{contact::Contact, id::NodeId};
use serde::{
    de::{Deserializer, Error as _},
    ser::Serializer,
    Deserialize, Serialize,
};
use serde_bytes::{ByteBuf, Bytes};
use std::{
    convert::TryInto,
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};
use thiserror::Error;

/// Kind of a value, carried as a four character tag.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Alternate location of a file.
    AltLoc,
    /// Push proxies of a firewalled host.
    PushProxies,
    /// Any other tag. Never accepted into a store.
    Other([u8; 4]),
}

impl ValueType {
    pub fn tag(&self) -> [u8; 4] {
        match self {
            Self::AltLoc => *b"ALT ",
            Self::PushProxies => *b"PROX",
            Self::Other(tag) => *tag,
        }
    }

    pub fn from_tag(tag: [u8; 4]) -> Self {
        match &tag {
            b"ALT " => Self::AltLoc,
            b"PROX" => Self::PushProxies,
            _ => Self::Other(tag),
        }
    }
}

impl fmt::Debug for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.tag()))
    }
}

impl Serialize for ValueType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        Bytes::new(&self.tag()).serialize(s)
    }
}

impl<'de> Deserialize<'de> for ValueType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let buf = ByteBuf::deserialize(d)?;
        let tag: [u8; 4] = buf
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::invalid_length(buf.len(), &"4 byte value type tag"))?;

        Ok(Self::from_tag(tag))
    }
}

/// Reasons a value is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueError {
    #[error("payload truncated")]
    Truncated,
    #[error("unexpected bytes after payload")]
    TrailingBytes,
    #[error("port must not be zero")]
    BadPort,
    #[error("invalid address length {0}")]
    BadAddressLength(u8),
    #[error("invalid firewalled flag {0}")]
    BadFlag(u8),
    #[error("unsupported value type {0:?}")]
    UnsupportedType(ValueType),
    #[error("tombstones are only accepted by the low-level add")]
    Tombstone,
}

/// A value stored under `key`. Stores hold at most one value per key and creator.
///
/// An empty payload is a tombstone: publishing it removes the creator's value for that key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub key: NodeId,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub version: u16,
    pub creator: Contact,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Value {
    pub fn new(key: NodeId, value_type: ValueType, creator: Contact, payload: Vec<u8>) -> Self {
        Self {
            key,
            value_type,
            version: 0,
            creator,
            payload,
        }
    }

    pub fn alt_loc(key: NodeId, creator: Contact, alt_loc: &AltLoc) -> Self {
        Self::new(key, ValueType::AltLoc, creator, alt_loc.encode())
    }

    pub fn push_proxies(key: NodeId, creator: Contact, proxies: &PushProxies) -> Self {
        Self::new(key, ValueType::PushProxies, creator, proxies.encode())
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_empty()
    }

    /// The tombstone replacing this value.
    pub fn to_tombstone(&self) -> Self {
        Self {
            payload: Vec::new(),
            ..self.clone()
        }
    }

    /// Check the payload is well formed for its type. Tombstones are always well formed.
    pub fn validate(&self) -> Result<(), ValueError> {
        if self.is_tombstone() {
            return Ok(());
        }

        match self.value_type {
            ValueType::AltLoc => AltLoc::decode(&self.payload).map(|_| ()),
            ValueType::PushProxies => PushProxies::decode(&self.payload).map(|_| ()),
            other => Err(ValueError::UnsupportedType(other)),
        }
    }
}

/// Firewall traversal details of an alternate location behind a firewall.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallInfo {
    pub features: u32,
    pub fwt_version: u32,
    pub push_proxy: SocketAddr,
}

/// Alternate location of a file, keyed by the file's SHA-1.
///
/// Encoded as `guid(16) | port(2) | firewalled(1)` followed, when firewalled, by
/// `features(4) | fwt_version(4) | addr_len(1) | addr | push_proxy_port(2)`. Big endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AltLoc {
    pub guid: [u8; 16],
    pub port: u16,
    pub firewall: Option<FirewallInfo>,
}

impl AltLoc {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(16 + 2 + 1 + 4 + 4 + 1 + 16 + 2);
        buffer.extend(self.guid);
        buffer.extend(self.port.to_be_bytes());

        match &self.firewall {
            Some(firewall) => {
                buffer.push(1);
                buffer.extend(firewall.features.to_be_bytes());
                buffer.extend(firewall.fwt_version.to_be_bytes());
                write_addr(&mut buffer, &firewall.push_proxy);
            }
            None => buffer.push(0),
        }

        buffer
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ValueError> {
        let mut reader = Reader::new(bytes);

        let guid = reader.array::<16>()?;
        let port = reader.u16()?;
        if port == 0 {
            return Err(ValueError::BadPort);
        }

        let firewall = match reader.u8()? {
            0 => None,
            1 => Some(FirewallInfo {
                features: reader.u32()?,
                fwt_version: reader.u32()?,
                push_proxy: reader.addr()?,
            }),
            flag => return Err(ValueError::BadFlag(flag)),
        };

        reader.finish()?;

        Ok(Self {
            guid,
            port,
            firewall,
        })
    }
}

/// Hosts relaying connection requests to a firewalled leaf.
///
/// Encoded as `count(4)` followed by `count` entries of `addr_len(1) | addr | port(2)`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PushProxies {
    pub proxies: Vec<SocketAddr>,
}

impl PushProxies {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(4 + self.proxies.len() * 19);
        buffer.extend((self.proxies.len() as u32).to_be_bytes());

        for proxy in &self.proxies {
            write_addr(&mut buffer, proxy);
        }

        buffer
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ValueError> {
        let mut reader = Reader::new(bytes);
        let count = reader.u32()? as usize;

        // Every entry takes at least 7 bytes.
        if count > reader.remaining() / 7 {
            return Err(ValueError::Truncated);
        }

        let mut proxies = Vec::with_capacity(count);
        for _ in 0..count {
            proxies.push(reader.addr()?);
        }

        reader.finish()?;

        Ok(Self { proxies })
    }
}

fn write_addr(buffer: &mut Vec<u8>, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(addr) => {
            buffer.push(4);
            buffer.extend(addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            buffer.push(16);
            buffer.extend(addr.ip().octets());
        }
    }

    buffer.extend(addr.port().to_be_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn remaining(&self) -> usize {
        self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ValueError> {
        if self.bytes.len() < len {
            return Err(ValueError::Truncated);
        }

        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ValueError> {
        self.take(N)?.try_into().map_err(|_| ValueError::Truncated)
    }

    fn u8(&mut self) -> Result<u8, ValueError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ValueError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ValueError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn addr(&mut self) -> Result<SocketAddr, ValueError> {
        let ip: std::net::IpAddr = match self.u8()? {
            4 => Ipv4Addr::from(self.array::<4>()?).into(),
            16 => Ipv6Addr::from(self.array::<16>()?).into(),
            len => return Err(ValueError::BadAddressLength(len)),
        };

        let port = self.u16()?;
        if port == 0 {
            return Err(ValueError::BadPort);
        }

        Ok(SocketAddr::new(ip, port))
    }

    fn finish(self) -> Result<(), ValueError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(ValueError::TrailingBytes)
        }
    }
}
