//! 48-bit Ethernet MAC addresses.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::Address;

/// An Ethernet MAC, stored in the low 48 bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Mac(u64);

impl Mac {
    pub const LENGTH: usize = 6;

    pub fn from_u64(v: u64) -> Self {
        Self(v & 0xffff_ffff_ffff)
    }

    pub fn from_bytes(b: [u8; 6]) -> Self {
        Self(
            ((b[0] as u64) << 40)
                | ((b[1] as u64) << 32)
                | ((b[2] as u64) << 24)
                | ((b[3] as u64) << 16)
                | ((b[4] as u64) << 8)
                | (b[5] as u64),
        )
    }

    /// The MAC a member uses on a given network, derived from its overlay
    /// address so that ARP is unnecessary between members that know each
    /// other's addresses. Locally-administered, unicast.
    pub fn from_address(addr: Address, nwid: u64) -> Self {
        let a = addr.to_u64();
        let mut first = (nwid & 0xfe) as u64 | 0x02;
        if first == 0x52 {
            // Reserved prefix used by some tap drivers; nudge off it.
            first = 0x32;
        }
        let mut m = first << 40;
        m |= a; // low 40 bits
        // Spread the network id through the address-derived bits.
        m ^= ((nwid >> 8) & 0xff) << 32;
        m ^= ((nwid >> 16) & 0xff) << 24;
        m ^= ((nwid >> 24) & 0xff) << 16;
        m ^= ((nwid >> 32) & 0xff) << 8;
        m ^= (nwid >> 40) & 0xff;
        Self(m & 0xffff_ffff_ffff)
    }

    /// Inverse of [`Mac::from_address`]; meaningful only for MACs that were
    /// derived on this network.
    pub fn to_address(self, nwid: u64) -> Address {
        let mut a = self.0 & 0xffff_ffff_ff;
        a ^= ((nwid >> 8) & 0xff) << 32;
        a ^= ((nwid >> 16) & 0xff) << 24;
        a ^= ((nwid >> 24) & 0xff) << 16;
        a ^= ((nwid >> 32) & 0xff) << 8;
        a ^= (nwid >> 40) & 0xff;
        Address::from_u64(a)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn to_bytes(self) -> [u8; 6] {
        [
            (self.0 >> 40) as u8,
            (self.0 >> 32) as u8,
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
        ]
    }

    pub fn is_broadcast(self) -> bool {
        self.0 == 0xffff_ffff_ffff
    }

    /// Group bit set (includes broadcast).
    pub fn is_multicast(self) -> bool {
        (self.0 & 0x0100_0000_0000) != 0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_roundtrip() {
        let m = Mac::from_bytes([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
        assert_eq!(Mac::from_bytes(m.to_bytes()), m);
        assert_eq!(m.to_u64(), 0x02aa_bbcc_ddee);
    }

    #[test]
    fn test_broadcast_and_multicast() {
        assert!(Mac::from_u64(0xffff_ffff_ffff).is_broadcast());
        assert!(Mac::from_u64(0xffff_ffff_ffff).is_multicast());
        assert!(Mac::from_u64(0x0133_0000_0001).is_multicast());
        assert!(!Mac::from_u64(0x0233_0000_0001).is_broadcast());
    }

    #[test]
    fn test_address_derivation_roundtrip() {
        let nwid = 0x8056_c2e2_1c00_0001u64;
        let addr = Address::from_u64(0x1122334455);
        let mac = Mac::from_address(addr, nwid);
        assert!(!mac.is_multicast());
        assert_eq!(mac.to_address(nwid), addr);
    }
}
