// Weft Core: peer-to-peer virtual Ethernet overlay, node engine
//
// "Does this move an Ethernet frame from one tap device to another,
//  encrypted, with no broker in the middle?"
//
// If the answer is no, it doesn't belong in core.

pub mod credentials;
pub mod crypto;
pub mod endpoint;
pub mod identity;
pub mod mac;
pub mod multicaster;
pub mod network;
pub mod node;
pub mod path;
pub mod peer;
pub mod self_awareness;
pub mod switch;
pub mod topology;
pub mod trace;
pub mod wire;
pub mod world;

use thiserror::Error;

/// Software version advertised in HELLO.
pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 3;
pub const VERSION_REVISION: u16 = 0;

pub use endpoint::{AddressFamily, Endpoint, IpScope};
pub use identity::{Address, Identity};
pub use mac::Mac;
pub use network::{NetworkStatus, VirtualNetworkConfigOperation, VirtualNetworkView};
pub use node::{
    Event, HostThread, Node, NodeHost, NodeOptions, NodeStatus, PathView, PeerView,
    StateObjectKind,
};
pub use topology::Role;
pub use wire::Verb;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Crate-level error taxonomy.
///
/// Wire-packet entry points never surface per-packet errors: malformed or
/// unauthenticated packets are dropped and counted by [`trace::Trace`].
/// These kinds cover the conditions a host must be able to distinguish.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("network not found")]
    NetworkNotFound,

    #[error("data store failed")]
    DataStoreFailed,

    #[error("out of memory")]
    OutOfMemory,

    /// Unexpected failure in a background pass. The node should be
    /// considered inoperable; the host's cue to terminate.
    #[error("fatal internal error")]
    InternalFatal,
}

pub type Result<T> = std::result::Result<T, Error>;
