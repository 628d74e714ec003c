// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Decoding of the hardware packet type reported in receive descriptors.

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum L3Type {
    None,
    Ipv4,
    Ipv6,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum L4Type {
    None,
    Fragment,
    Udp,
    Tcp,
    Sctp,
    Icmp,
}

/// The parsed meaning of a packet type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketType {
    pub known: bool,
    pub l3: L3Type,
    pub l4: L4Type,
}

/// The RSS hash type that matches a packet type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HashType {
    /// Hash over the L2 header only.
    L2,
    /// Hash over the IP addresses.
    L3,
    /// Hash over the IP addresses and the L4 ports.
    L4,
}

impl PacketType {
    const UNKNOWN: Self = Self {
        known: false,
        l3: L3Type::None,
        l4: L4Type::None,
    };

    const fn new(l3: L3Type, l4: L4Type) -> Self {
        Self {
            known: true,
            l3,
            l4,
        }
    }

    /// Decodes a packet type number.
    pub fn lookup(ptype: u16) -> Self {
        use L3Type::*;
        use L4Type::*;
        match ptype {
            1 => Self::new(L3Type::None, L4Type::None),
            22 => Self::new(Ipv4, Fragment),
            23 => Self::new(Ipv4, L4Type::None),
            24 => Self::new(Ipv4, Udp),
            26 => Self::new(Ipv4, Tcp),
            27 => Self::new(Ipv4, Sctp),
            28 => Self::new(Ipv4, Icmp),
            88 => Self::new(Ipv6, Fragment),
            89 => Self::new(Ipv6, L4Type::None),
            90 => Self::new(Ipv6, Udp),
            92 => Self::new(Ipv6, Tcp),
            93 => Self::new(Ipv6, Sctp),
            94 => Self::new(Ipv6, Icmp),
            _ => Self::UNKNOWN,
        }
    }

    pub fn hash_type(self) -> HashType {
        match (self.l3, self.l4) {
            (L3Type::None, _) => HashType::L2,
            (_, L4Type::Udp | L4Type::Tcp | L4Type::Sctp) => HashType::L4,
            _ => HashType::L3,
        }
    }

    /// Returns true if the hardware validates an L4 checksum for this type.
    pub fn has_l4_checksum(self) -> bool {
        matches!(self.l4, L4Type::Udp | L4Type::Tcp | L4Type::Sctp)
    }
}
