//! Fragmentation of packets larger than one UDP payload.
//!
//! Fragment 0 is the head packet itself, truncated at the MTU with its
//! fragmented flag set. Continuations share the packet id and carry:
//!
//! ```text
//! [8]  packet id
//! [5]  destination address
//! [1]  0xff fragment indicator (impossible as a source high byte)
//! [1]  total << 4 | index      (index in 1..total)
//! [1]  hops
//! [N]  payload slice
//! ```

use crate::identity::Address;

use super::{WireError, MAX_FRAGMENTS, PACKET_HEADER_LEN, UDP_DEFAULT_PAYLOAD_MTU};

/// Marker at byte 13 distinguishing continuations from head packets.
pub const FRAGMENT_INDICATOR: u8 = 0xff;

pub const FRAGMENT_HEADER_LEN: usize = 16;

/// Does this datagram look like a fragment continuation?
pub fn is_fragment(bytes: &[u8]) -> bool {
    bytes.len() > FRAGMENT_HEADER_LEN && bytes[13] == FRAGMENT_INDICATOR
}

/// A parsed fragment continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub packet_id: u64,
    pub dest: Address,
    pub index: u8,
    pub total: u8,
    pub hops: u8,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() <= FRAGMENT_HEADER_LEN {
            return Err(WireError::BufferTooShort {
                need: FRAGMENT_HEADER_LEN + 1,
                got: bytes.len(),
            });
        }
        if bytes[13] != FRAGMENT_INDICATOR {
            return Err(WireError::BadFragment);
        }
        let packet_id = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
        let dest = Address::read_from(&bytes[8..13])?;
        let total = bytes[14] >> 4;
        let index = bytes[14] & 0x0f;
        if index == 0 || index >= total || total as usize > MAX_FRAGMENTS {
            return Err(WireError::BadFragment);
        }
        Ok(Self {
            packet_id,
            dest,
            index,
            total,
            hops: bytes[15] & 0x07,
            payload: bytes[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.packet_id.to_be_bytes());
        self.dest.append_to(&mut out);
        out.push(FRAGMENT_INDICATOR);
        out.push((self.total << 4) | (self.index & 0x0f));
        out.push(self.hops & 0x07);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Split an encoded packet into MTU-sized datagrams. The head keeps the
/// first MTU bytes; the caller must have set the fragmented flag before
/// armoring (the flag is part of the authenticated header).
pub fn split(wire: &[u8]) -> Result<Vec<Vec<u8>>, WireError> {
    if wire.len() <= UDP_DEFAULT_PAYLOAD_MTU {
        return Ok(vec![wire.to_vec()]);
    }

    let chunk_len = UDP_DEFAULT_PAYLOAD_MTU - FRAGMENT_HEADER_LEN;
    let remainder = &wire[UDP_DEFAULT_PAYLOAD_MTU..];
    let continuation_count = remainder.len().div_ceil(chunk_len);
    let total = 1 + continuation_count;
    if total > MAX_FRAGMENTS {
        return Err(WireError::TooLarge(wire.len()));
    }

    let packet_id = u64::from_be_bytes(wire[0..8].try_into().unwrap());
    let dest = Address::read_from(&wire[8..13])?;
    let hops = wire[18] & 0x07;

    let mut out = Vec::with_capacity(total);
    out.push(wire[..UDP_DEFAULT_PAYLOAD_MTU].to_vec());
    for (i, chunk) in remainder.chunks(chunk_len).enumerate() {
        out.push(
            Fragment {
                packet_id,
                dest,
                index: (i + 1) as u8,
                total: total as u8,
                hops,
                payload: chunk.to_vec(),
            }
            .encode(),
        );
    }
    Ok(out)
}

/// Reassembly state for one in-flight fragmented packet, keyed by packet id
/// in the Switch. Completed packets yield the original armored bytes.
#[derive(Debug)]
pub struct FragmentAssembly {
    pub arrived_at: i64,
    head: Option<Vec<u8>>,
    continuations: Vec<Option<Vec<u8>>>,
    total: Option<u8>,
}

impl FragmentAssembly {
    pub fn new(now: i64) -> Self {
        Self { arrived_at: now, head: None, continuations: Vec::new(), total: None }
    }

    pub fn add_head(&mut self, head: Vec<u8>) {
        self.head = Some(head);
    }

    pub fn add_fragment(&mut self, frag: Fragment) -> Result<(), WireError> {
        match self.total {
            Some(t) if t != frag.total => return Err(WireError::BadFragment),
            None => {
                self.total = Some(frag.total);
                self.continuations.resize((frag.total - 1) as usize, None);
            }
            _ => {}
        }
        let slot = (frag.index - 1) as usize;
        if slot >= self.continuations.len() {
            return Err(WireError::BadFragment);
        }
        self.continuations[slot] = Some(frag.payload);
        Ok(())
    }

    /// If every piece is present, concatenate back into the armored packet.
    pub fn try_complete(&mut self) -> Option<Vec<u8>> {
        let head = self.head.as_ref()?;
        self.total?;
        if self.continuations.iter().any(|c| c.is_none()) {
            return None;
        }
        let mut out = head.clone();
        for c in &self.continuations {
            out.extend_from_slice(c.as_ref().unwrap());
        }
        Some(out)
    }
}
