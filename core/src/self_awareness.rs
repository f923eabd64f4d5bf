//! Learning our own external addresses from what peers report back.
//!
//! Every HELLO we send names the endpoint we addressed; every OK(HELLO)
//! echoes the endpoint the peer saw us come from. Those reflexive reports
//! are recorded per (reporter, receiving socket, scope). When a trusted
//! reporter's view of us changes within a scope (typically a NAT mapping
//! rebind), all paths in that scope are reset so fresh HELLOs rebuild
//! them, and live networks re-announce their multicast subscriptions.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::endpoint::{Endpoint, IpScope};
use crate::identity::Address;
use crate::node::{Context, HostThread};

/// Reports older than this no longer describe us.
pub const SELF_AWARENESS_AGE: i64 = 600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SurfaceKey {
    reporter: Address,
    receiving_socket: i64,
    scope: IpScope,
}

#[derive(Debug, Clone, Copy)]
struct SurfaceEntry {
    reflexive: Endpoint,
    timestamp: i64,
}

#[derive(Default)]
pub struct SelfAwareness {
    surfaces: Mutex<HashMap<SurfaceKey, SurfaceEntry>>,
}

impl SelfAwareness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one reflexive report: "reporter, over this socket, says we
    /// are `reflexive`". Trusted reports that contradict the previous
    /// entry trigger the scope reset.
    #[allow(clippy::too_many_arguments)]
    pub fn iam(
        &self,
        ctx: &Context,
        tptr: HostThread,
        reporter: Address,
        receiving_socket: i64,
        reflexive: Endpoint,
        trusted: bool,
        now: i64,
    ) {
        let scope = reflexive.scope();
        if !reflexive.is_valid_for_path() || scope == IpScope::Loopback {
            return;
        }

        let key = SurfaceKey { reporter, receiving_socket, scope };
        let changed = {
            let mut surfaces = self.surfaces.lock();
            match surfaces.insert(key, SurfaceEntry { reflexive, timestamp: now }) {
                Some(prev) => prev.reflexive != reflexive && now - prev.timestamp < SELF_AWARENESS_AGE,
                None => false,
            }
        };

        if changed && trusted {
            tracing::info!(
                %reporter, %reflexive, ?scope,
                "external address changed; resetting paths in scope"
            );

            // Reset paths in the affected scope so new HELLOs re-establish
            // them against the new mapping.
            ctx.topology.each_peer(|peer| {
                peer.reset_paths_in_scope(scope);
            });

            // Membership and subscriptions were advertised from the old
            // surface; re-announce them.
            let networks: Vec<_> = ctx.networks.read().values().cloned().collect();
            for network in networks {
                network.announce_multicast_groups(ctx, tptr, now);
            }
        }
    }

    /// Current belief about our external endpoints, most recent first.
    pub fn local_surface(&self, now: i64) -> Vec<Endpoint> {
        let surfaces = self.surfaces.lock();
        let mut entries: Vec<&SurfaceEntry> =
            surfaces.values().filter(|e| now - e.timestamp < SELF_AWARENESS_AGE).collect();
        entries.sort_by_key(|e| -e.timestamp);
        let mut out: Vec<Endpoint> = Vec::new();
        for e in entries {
            if !out.contains(&e.reflexive) {
                out.push(e.reflexive);
            }
        }
        out
    }

    /// Age out stale reports.
    pub fn clean(&self, now: i64) {
        self.surfaces.lock().retain(|_, e| now - e.timestamp < SELF_AWARENESS_AGE);
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.surfaces.lock().len()
    }
}
