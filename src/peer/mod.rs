//! Connections to remote nodes.

mod conn;
mod mconn;
mod set;

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::atomic::{AtomicU8, Ordering},
};

use bytes::Bytes;

pub use self::{
    conn::{AsyncStream, BoxedStream, PeerConfig, PeerConn, Plaintext, SecureTransport},
    mconn::{ChannelDescriptor, MConnection},
    set::PeerSet,
};
use crate::core::node_info::NodeInfo;

// Lifecycle states, a peer only moves forward through them.
const ADDING: u8 = 0;
const RUNNING: u8 = 1;
// A stop was requested while reactors were still being told about the peer.
const STOP_PENDING: u8 = 2;
const STOPPED: u8 = 3;

/// An active, handshaken connection to a remote node.
pub struct Peer {
    key: String,
    outbound: bool,
    node_info: NodeInfo,
    mconn: MConnection,
    state: AtomicU8,
}

impl Peer {
    pub(crate) fn new(conn: PeerConn, node_info: NodeInfo, channels: &[ChannelDescriptor]) -> Self {
        let outbound = conn.is_outbound();
        let (stream, read_buf) = conn.into_parts();

        Self {
            key: node_info.pub_key.to_string(),
            outbound,
            node_info,
            mconn: MConnection::new(stream, read_buf, channels),
            state: AtomicU8::new(ADDING),
        }
    }

    /// The peer's registry key, the hex encoding of its public key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn node_info(&self) -> &NodeInfo {
        &self.node_info
    }

    /// The address the connection was observed from.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.node_info.remote_addr
    }

    /// The IP the connection was observed from.
    pub fn remote_addr_host(&self) -> Option<IpAddr> {
        self.node_info.remote_addr_host()
    }

    /// Queues a message on a channel without blocking; `false` means it was dropped.
    pub fn try_send(&self, channel: u8, bytes: Bytes) -> bool {
        self.mconn.try_send(channel, bytes)
    }

    pub fn is_running(&self) -> bool {
        !self.mconn.is_stopped()
    }

    pub(crate) fn start<R, E>(&self, on_receive: R, on_error: E)
    where
        R: FnMut(u8, Bytes) + Send + 'static,
        E: FnOnce(String) + Send + 'static,
    {
        self.mconn.start(on_receive, on_error)
    }

    /// Claims the right to tear the peer down, only the first caller gets `true`.
    ///
    /// A peer still being added can't be torn down yet: the request is recorded and `false` is
    /// returned, [`finish_add`](Self::finish_add) then reports it to the adding task.
    pub(crate) fn begin_stop(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                ADDING => STOP_PENDING,
                RUNNING => STOPPED,
                _ => return false,
            };

            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next == STOPPED,
                Err(actual) => current = actual,
            }
        }
    }

    /// Marks the peer as fully added. Returns `false` if a stop was requested in the meantime, in
    /// which case the caller owns the teardown.
    pub(crate) fn finish_add(&self) -> bool {
        match self
            .state
            .compare_exchange(ADDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                self.state.store(STOPPED, Ordering::Release);
                false
            }
        }
    }

    /// Abandons a peer that never finished being added.
    pub(crate) fn abort(&self) {
        self.state.store(STOPPED, Ordering::Release);
        self.mconn.stop()
    }

    pub(crate) fn stop(&self) {
        self.mconn.stop()
    }

    #[cfg(test)]
    /// Convenience function for building peers without a network during testing.
    pub(crate) fn mock(id: u16, outbound: bool, remote_addr: SocketAddr) -> std::sync::Arc<Self> {
        use crate::core::id::PubKey;

        let (stream, _) = tokio::io::duplex(64);
        let conn = PeerConn::new(Box::new(stream), remote_addr, outbound, PeerConfig::default());
        let node_info = NodeInfo {
            pub_key: PubKey::from_u16(id),
            moniker: format!("mock-{id}"),
            network: "testnet".to_string(),
            remote_addr: Some(remote_addr),
            listen_addr: remote_addr,
            version: "0.1.0".to_string(),
            other: vec![],
        };

        let peer = Self::new(conn, node_info, &[ChannelDescriptor::new(0x00)]);
        peer.finish_add();

        std::sync::Arc::new(peer)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("key", &self.key)
            .field("outbound", &self.outbound)
            .field("remote_addr", &self.node_info.remote_addr)
            .finish()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.outbound { "out" } else { "in" };
        match self.node_info.remote_addr {
            Some(addr) => write!(f, "Peer{{{} {} {}}}", self.key, addr, direction),
            None => write!(f, "Peer{{{} {}}}", self.key, direction),
        }
    }
}
