use std::fmt;

/// How the local host takes part in the DHT.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// No DHT at all.
    #[default]
    Inactive,
    /// Full node, present in other nodes' routing tables.
    Active,
    /// Uses the DHT without being indexed by it.
    Passive,
    /// Firewalled leaf using the DHT through its ultrapeer.
    PassiveLeaf,
}

impl Mode {
    /// Four byte tag advertised to Gnutella peers in capability messages.
    pub fn capability_tag(&self) -> [u8; 4] {
        match self {
            Self::Inactive => *b"IDHT",
            Self::Active => *b"ADHT",
            Self::Passive => *b"PDHT",
            Self::PassiveLeaf => *b"LDHT",
        }
    }

    pub fn from_capability_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"IDHT" => Some(Self::Inactive),
            b"ADHT" => Some(Self::Active),
            b"PDHT" => Some(Self::Passive),
            b"LDHT" => Some(Self::PassiveLeaf),
            _ => None,
        }
    }

    /// Whether the local contact is advertised as firewalled, keeping it out of remote tables.
    pub(crate) fn is_firewalled(&self) -> bool {
        matches!(self, Self::Passive | Self::PassiveLeaf)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Passive => "passive",
            Self::PassiveLeaf => "passive-leaf",
        };

        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_capability_tags() {
        for mode in [Mode::Inactive, Mode::Active, Mode::Passive, Mode::PassiveLeaf] {
            assert_eq!(Mode::from_capability_tag(&mode.capability_tag()), Some(mode));
        }

        assert_eq!(&Mode::Active.capability_tag(), b"ADHT");
        assert_eq!(Mode::from_capability_tag(b"XDHT"), None);
    }
}
