//! Peer discovery and connection management for a peer-to-peer overlay.
//!
//! The crate is built from three cooperating parts:
//!
//! 1. The [`AddrBook`](book::AddrBook), a bucketed store of known addresses. Addresses enter
//!    "new" buckets and are promoted to "old" buckets once a connection to them succeeds; bucket
//!    placement is keyed by a per-book secret so a single source can't flood the book.
//! 2. The [`Switch`](switch::Switch), which dials and accepts connections, exchanges identity
//!    documents, registers peers and routes every inbound message to the [`Reactor`] owning its
//!    channel.
//! 3. The [`PexReactor`](pex::PexReactor), a reactor keeping the node connected by dialing
//!    addresses from the book and asking peers for more.
//!
//! Connections are secured by a pluggable [`SecureTransport`](peer::SecureTransport), the
//! [`Plaintext`](peer::Plaintext) transport is provided for trusted networks and testing.

pub mod book;
pub mod codec;
pub mod config;
pub mod error;
pub mod peer;
pub mod pex;
pub mod switch;

mod core;

pub use crate::core::{
    addr::NetAddress,
    id::{NodeKey, PubKey},
    message,
    node_info::{NodeInfo, MAX_NODE_INFO_SIZE},
    traits::Reactor,
};
