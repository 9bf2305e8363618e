use std::net::{IpAddr, SocketAddr};

/// Coarse network a host lives in: its /24 for IPv4, its /48 for IPv6.
///
/// Buckets cap how many contacts may come from one such network so a single subnet cannot fill
/// the routing table.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) enum NetworkClass {
    V4([u8; 3]),
    V6([u8; 6]),
}

impl NetworkClass {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => {
                let o = ip.octets();
                Self::V4([o[0], o[1], o[2]])
            }
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(ip) => {
                    let o = ip.octets();
                    Self::V4([o[0], o[1], o[2]])
                }
                None => {
                    let o = ip.octets();
                    Self::V6([o[0], o[1], o[2], o[3], o[4], o[5]])
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn positive_same_class_c() {
        let a: SocketAddr = (Ipv4Addr::new(192, 168, 1, 10), 1).into();
        let b: SocketAddr = (Ipv4Addr::new(192, 168, 1, 200), 2).into();
        let c: SocketAddr = (Ipv4Addr::new(192, 168, 2, 10), 1).into();

        assert_eq!(NetworkClass::of(&a), NetworkClass::of(&b));
        assert_ne!(NetworkClass::of(&a), NetworkClass::of(&c));
    }

    #[test]
    fn positive_mapped_v6_is_v4() {
        let v4: SocketAddr = (Ipv4Addr::new(192, 168, 1, 10), 1).into();
        let mapped: SocketAddr = (Ipv4Addr::new(192, 168, 1, 11).to_ipv6_mapped(), 1).into();
        let v6: SocketAddr = (Ipv6Addr::new(0x2001, 0xdb8, 1, 2, 0, 0, 0, 1), 1).into();

        assert_eq!(NetworkClass::of(&v4), NetworkClass::of(&mapped));
        assert!(matches!(NetworkClass::of(&v6), NetworkClass::V6(_)));
    }
}
