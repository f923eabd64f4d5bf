//! Drop accounting and structured trace logging.
//!
//! Per the error policy, a bad packet is never an error to the caller: it
//! is a counted drop. This module is where those events land, both as
//! monotonic counters (cheap, always on) and as `tracing` events for hosts
//! that subscribe to a collector.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::endpoint::Endpoint;
use crate::identity::Address;

/// Why an inbound datagram was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    MacFailed,
    InvalidIdentity,
    Unroutable,
    ReassemblyTimeout,
    QueueOverflow,
    RateLimited,
    RuleRejected,
    CredentialRejected,
}

#[derive(Default)]
pub struct Trace {
    packets_dropped: AtomicU64,
    frames_dropped: AtomicU64,
    credentials_rejected: AtomicU64,
    whois_timeouts: AtomicU64,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incoming_packet_dropped(&self, source: Address, remote: Option<Endpoint>, reason: DropReason) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%source, ?remote, ?reason, "dropped wire packet");
    }

    pub fn outgoing_frame_dropped(&self, nwid: u64, reason: DropReason) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(nwid = format_args!("{:016x}", nwid), ?reason, "dropped frame");
    }

    pub fn incoming_frame_dropped(&self, nwid: u64, source: Address, reason: DropReason) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(nwid = format_args!("{:016x}", nwid), %source, ?reason, "dropped frame");
    }

    pub fn credential_rejected(&self, nwid: u64, issued_to: Address) {
        self.credentials_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(nwid = format_args!("{:016x}", nwid), %issued_to, "rejected credential");
    }

    pub fn whois_abandoned(&self, target: Address) {
        self.whois_timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%target, "WHOIS abandoned after retries");
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn credentials_rejected_count(&self) -> u64 {
        self.credentials_rejected.load(Ordering::Relaxed)
    }

    pub fn whois_timeouts_count(&self) -> u64 {
        self.whois_timeouts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let t = Trace::new();
        t.incoming_packet_dropped(Address::from_u64(1), None, DropReason::MacFailed);
        t.incoming_packet_dropped(Address::from_u64(2), None, DropReason::Malformed);
        t.outgoing_frame_dropped(7, DropReason::RuleRejected);
        assert_eq!(t.packets_dropped(), 2);
        assert_eq!(t.frames_dropped(), 1);
        assert_eq!(t.credentials_rejected_count(), 0);
    }
}
