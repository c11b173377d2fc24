//! Error types for every subsystem.

use std::{io, net::IpAddr};

use thiserror::Error;

use crate::core::{addr::NetAddress, id::PubKey};

/// Failures loading the node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Addr(#[from] AddrError),
}

/// Failures parsing a [`NetAddress`].
#[derive(Debug, Error)]
pub enum AddrError {
    #[error("invalid address {0:?}, expected ip:port")]
    Invalid(String),

    #[error("invalid identity prefix {0:?}, expected hex encoded public key")]
    InvalidId(String),
}

/// Address book errors.
#[derive(Debug, Error)]
pub enum AddrBookError {
    #[error("cannot add our own address {0}")]
    OwnAddress(NetAddress),

    /// Only raised when strict routability checking is enabled.
    #[error("cannot add non-routable address {0}")]
    NonRoutable(NetAddress),

    #[error("address book I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("address book serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt address book: {0}")]
    Corrupt(String),
}

/// The reasons a remote identity document is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompatibilityError {
    #[error("our version {0:?} is malformed")]
    OurVersion(String),

    #[error("peer version {0:?} is malformed")]
    TheirVersion(String),

    #[error("major version mismatch: ours {ours}, theirs {theirs}")]
    Major { ours: String, theirs: String },

    #[error("minor version mismatch: ours {ours}, theirs {theirs}")]
    Minor { ours: String, theirs: String },

    #[error("network mismatch: ours {ours:?}, theirs {theirs:?}")]
    Network { ours: String, theirs: String },
}

/// Failures exchanging identity documents.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,

    #[error("handshake I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection during the handshake")]
    Closed,

    #[error("invalid identity document: {0}")]
    Invalid(String),
}

/// A reactor refused a peer or one of its messages.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ReactorError(pub String);

impl ReactorError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Switch errors, covering the full connection lifecycle.
#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("dial to {0} timed out")]
    DialTimeout(NetAddress),

    #[error("dial to {addr} failed: {source}")]
    Dial {
        addr: NetAddress,
        #[source]
        source: io::Error,
    },

    #[error("secure upgrade failed: {0}")]
    Upgrade(#[source] io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Incompatible(#[from] CompatibilityError),

    #[error("duplicate peer {0}")]
    DuplicatePeer(String),

    #[error("attempted to connect to ourselves")]
    ConnectSelf,

    #[error("peer {0} is banned")]
    BannedPeer(IpAddr),

    #[error("dialed {expected} but {actual} answered")]
    UnexpectedIdentity { expected: PubKey, actual: PubKey },

    #[error("reactor {reactor} rejected the peer: {source}")]
    Rejected {
        reactor: &'static str,
        #[source]
        source: ReactorError,
    },

    #[error("channel {id:#04x} is claimed by both {first} and {second}")]
    DuplicateChannel {
        id: u8,
        first: &'static str,
        second: &'static str,
    },

    #[error("peer {0} was stopped before it finished connecting")]
    PeerStopped(String),

    #[error("already at the maximum of {0} peers")]
    TooManyPeers(usize),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: NetAddress,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error("the switch is stopped")]
    Stopped,
}

/// A shorthand for results carrying a [`SwitchError`].
pub type Result<T, E = SwitchError> = std::result::Result<T, E>;
