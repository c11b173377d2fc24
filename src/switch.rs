//! The switch: owner of every peer connection and dispatcher of their messages.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{
    book::SyncAddrBook,
    config::Config,
    core::{addr::NetAddress, id::NodeKey, id::PubKey, node_info::NodeInfo, traits::Reactor},
    error::{Result, SwitchError},
    peer::{ChannelDescriptor, Peer, PeerConfig, PeerConn, PeerSet, SecureTransport},
};

/// The protocol version advertised in our identity document.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Removes an address from the in-flight dial set when dropped.
struct DialingGuard<'a> {
    dialing: &'a DashMap<IpAddr, NetAddress>,
    ip: IpAddr,
}

impl Drop for DialingGuard<'_> {
    fn drop(&mut self) {
        self.dialing.remove(&self.ip);
    }
}

/// Coordinates the peer lifecycle: dialing, accepting, handshaking, registering and tearing down
/// peers, and routing their inbound messages to the owning [`Reactor`].
pub struct Switch {
    config: Config,
    peer_config: PeerConfig,
    node_key: NodeKey,
    node_info: RwLock<NodeInfo>,
    transport: Arc<dyn SecureTransport>,
    book: SyncAddrBook,
    reactors: Vec<Arc<dyn Reactor>>,
    /// Built once at construction, never modified.
    reactors_by_ch: HashMap<u8, Arc<dyn Reactor>>,
    channels: Vec<ChannelDescriptor>,
    peers: PeerSet,
    /// Addresses currently being dialed, keyed by host.
    dialing: DashMap<IpAddr, NetAddress>,
    /// Banned hosts and when their ban expires.
    banned: DashMap<IpAddr, OffsetDateTime>,
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl Switch {
    /// Creates a switch serving the supplied reactors.
    ///
    /// Fails if two reactors claim the same channel or the configured listen address is malformed.
    pub fn new(
        config: Config,
        node_key: NodeKey,
        book: SyncAddrBook,
        transport: Arc<dyn SecureTransport>,
        reactors: Vec<Arc<dyn Reactor>>,
    ) -> Result<Arc<Self>> {
        let mut reactors_by_ch: HashMap<u8, Arc<dyn Reactor>> = HashMap::new();
        let mut channels = Vec::new();

        for reactor in &reactors {
            for ch in reactor.channels() {
                if let Some(first) = reactors_by_ch.get(&ch.id) {
                    return Err(SwitchError::DuplicateChannel {
                        id: ch.id,
                        first: first.name(),
                        second: reactor.name(),
                    });
                }

                reactors_by_ch.insert(ch.id, reactor.clone());
                channels.push(ch);
            }
        }

        let node_info = NodeInfo {
            pub_key: node_key.pub_key(),
            moniker: config.moniker.clone(),
            network: config.network.clone(),
            remote_addr: None,
            listen_addr: config.listen_net_address()?.socket_addr(),
            version: VERSION.to_string(),
            other: Vec::new(),
        };

        let switch = Arc::new_cyclic(|weak| {
            for reactor in &reactors {
                reactor.set_switch(weak.clone());
            }

            Self {
                peer_config: config.peer_config(),
                config,
                node_key,
                node_info: RwLock::new(node_info),
                transport,
                book,
                reactors,
                reactors_by_ch,
                channels,
                peers: PeerSet::new(),
                dialing: DashMap::new(),
                banned: DashMap::new(),
                listener: Mutex::new(None),
                shutdown: CancellationToken::new(),
                stopped: AtomicBool::new(false),
            }
        });

        Ok(switch)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn book(&self) -> &SyncAddrBook {
        &self.book
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn pub_key(&self) -> PubKey {
        self.node_key.pub_key()
    }

    /// Returns a copy of our identity document.
    pub fn node_info(&self) -> NodeInfo {
        self.node_info.read().clone()
    }

    /// Our advertised listener as an address book entry.
    pub fn listen_net_address(&self) -> NetAddress {
        self.node_info.read().listen_net_address()
    }

    /// Binds the configured listen address and advertises the bound address.
    pub async fn bind(&self) -> Result<SocketAddr> {
        let addr = self.config.listen_net_address()?;

        let bind_err = |source| SwitchError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind(addr.socket_addr())
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        self.node_info.write().listen_addr = local_addr;
        self.book.add_our_address(NetAddress::from(local_addr));
        *self.listener.lock() = Some(listener);

        info!(addr = %local_addr, "listening");

        Ok(local_addr)
    }

    /// Starts the reactors, and the accept loop if [`bind`](Self::bind) was called.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(SwitchError::Stopped);
        }

        for reactor in &self.reactors {
            debug!(reactor = reactor.name(), "starting reactor");
            reactor.clone().start(self.shutdown.child_token());
        }

        if let Some(listener) = self.listener.lock().take() {
            tokio::spawn(self.clone().accept_routine(listener));
        }

        info!(pub_key = %self.pub_key(), "switch started");

        Ok(())
    }

    /// Stops every peer and reactor. Calling this more than once is a no-op.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();
        self.listener.lock().take();

        for peer in self.peers.list() {
            self.stop_and_remove_peer(&peer, "switch stopped");
        }

        for reactor in &self.reactors {
            reactor.stop();
        }

        info!("switch stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    async fn accept_routine(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept a connection");
                        continue;
                    }
                },
            };

            if self.peers.size() >= self.config.max_num_peers {
                debug!(addr = %addr, max = self.config.max_num_peers, "refusing inbound connection, too many peers");
                continue;
            }

            if self.is_banned(addr.ip()) {
                debug!(addr = %addr, "refusing inbound connection from banned host");
                continue;
            }

            let switch = self.clone();
            let conn = PeerConn::inbound(stream, addr, self.peer_config);

            tokio::spawn(async move {
                if let Err(e) = switch.add_peer(conn).await {
                    debug!(addr = %addr, error = %e, "failed to add inbound peer");
                }
            });
        }

        debug!("accept routine stopped");
    }

    /// Dials the address and registers the resulting peer.
    ///
    /// The address is marked as being dialed for the duration of the call, whatever the outcome.
    pub async fn dial_peer_with_address(self: &Arc<Self>, addr: &NetAddress) -> Result<Arc<Peer>> {
        if self.shutdown.is_cancelled() {
            return Err(SwitchError::Stopped);
        }

        if self.is_banned(addr.ip) {
            return Err(SwitchError::BannedPeer(addr.ip));
        }

        self.dialing.insert(addr.ip, addr.clone());
        let _guard = DialingGuard {
            dialing: &self.dialing,
            ip: addr.ip,
        };

        debug!(addr = %addr, "dialing peer");

        let conn = PeerConn::dial(addr, self.peer_config).await?;
        let res = self.add_peer(conn).await;

        if let Err(SwitchError::ConnectSelf) = res {
            // Never dial it again.
            self.book.remove_address(addr);
            self.book.add_our_address(addr.clone());
        }

        res
    }

    /// Returns `true` if an address on the same host is being dialed.
    pub fn is_dialing(&self, addr: &NetAddress) -> bool {
        self.dialing.contains_key(&addr.ip)
    }

    /// Upgrades and handshakes the connection, then registers the peer and announces it to every
    /// reactor before its first message is read.
    pub async fn add_peer(self: &Arc<Self>, conn: PeerConn) -> Result<Arc<Peer>> {
        let conn = conn
            .upgrade(self.transport.as_ref(), &self.node_key)
            .await?;

        let our_info = self.node_info();
        let (conn, their_info) = conn.handshake(&our_info).await?;
        self.filter_peer(&conn, &our_info, &their_info)?;

        let peer = Arc::new(Peer::new(conn, their_info, &self.channels));

        // Registration is the deduplication point, a losing duplicate is dropped (and its
        // connection closed) here.
        self.peers.add(peer.clone())?;

        if self.shutdown.is_cancelled() {
            self.abort_peer(&peer);
            return Err(SwitchError::Stopped);
        }

        for (i, reactor) in self.reactors.iter().enumerate() {
            if let Err(source) = reactor.add_peer(&peer) {
                let reason = source.to_string();
                for accepted in &self.reactors[..i] {
                    accepted.remove_peer(&peer, &reason);
                }
                self.abort_peer(&peer);

                return Err(SwitchError::Rejected {
                    reactor: reactor.name(),
                    source,
                });
            }
        }

        if !peer.finish_add() {
            // Stopped by a reactor hook, a ban or shutdown while the reactors were being told.
            for reactor in &self.reactors {
                reactor.remove_peer(&peer, "stopped while being added");
            }
            self.peers.remove(&peer);
            peer.stop();

            return Err(SwitchError::PeerStopped(peer.key().to_string()));
        }

        self.start_peer(&peer);
        info!(peer = %peer, moniker = %peer.node_info().moniker, "added peer");

        Ok(peer)
    }

    fn filter_peer(&self, conn: &PeerConn, ours: &NodeInfo, theirs: &NodeInfo) -> Result<()> {
        if theirs.pub_key == ours.pub_key {
            return Err(SwitchError::ConnectSelf);
        }

        if let Some(expected) = conn.expected_id() {
            if expected != theirs.pub_key {
                return Err(SwitchError::UnexpectedIdentity {
                    expected,
                    actual: theirs.pub_key,
                });
            }
        }

        let host = conn.socket_addr().ip();
        if self.is_banned(host) {
            return Err(SwitchError::BannedPeer(host));
        }

        ours.compatible_with(theirs)?;

        if !conn.is_outbound() && self.peers.size() >= self.config.max_num_peers {
            return Err(SwitchError::TooManyPeers(self.config.max_num_peers));
        }

        Ok(())
    }

    fn start_peer(self: &Arc<Self>, peer: &Arc<Peer>) {
        let (switch, weak_peer) = (Arc::downgrade(self), Arc::downgrade(peer));
        let (err_switch, err_peer) = (switch.clone(), weak_peer.clone());

        peer.start(
            move |channel, bytes| {
                if let (Some(switch), Some(peer)) = (switch.upgrade(), weak_peer.upgrade()) {
                    switch.dispatch(channel, &peer, bytes);
                }
            },
            move |reason| {
                if let (Some(switch), Some(peer)) = (err_switch.upgrade(), err_peer.upgrade()) {
                    switch.stop_peer_for_error(&peer, &reason);
                }
            },
        );
    }

    fn dispatch(&self, channel: u8, peer: &Arc<Peer>, bytes: Bytes) {
        let reactor = match self.reactors_by_ch.get(&channel) {
            Some(reactor) => reactor,
            // Connections only accept the channels collected from the reactors.
            None => unreachable!("no reactor registered for channel {channel:#04x}"),
        };

        if let Err(e) = reactor.receive(channel, peer, bytes) {
            self.stop_peer_for_error(peer, &e.to_string());
        }
    }

    /// Disconnects a misbehaving or failed peer.
    pub fn stop_peer_for_error(&self, peer: &Arc<Peer>, reason: &str) {
        warn!(peer = %peer, reason = %reason, "stopping peer for error");
        self.stop_and_remove_peer(peer, reason);
    }

    /// Disconnects a peer.
    pub fn stop_peer_gracefully(&self, peer: &Arc<Peer>) {
        debug!(peer = %peer, "stopping peer gracefully");
        self.stop_and_remove_peer(peer, "stopped gracefully");
    }

    // Reactors hear about the removal while the peer is still registered.
    fn stop_and_remove_peer(&self, peer: &Arc<Peer>, reason: &str) {
        if !peer.begin_stop() {
            return;
        }

        for reactor in &self.reactors {
            reactor.remove_peer(peer, reason);
        }

        self.peers.remove(peer);
        peer.stop();
    }

    // Unwinds a registration no reactor has been told about.
    fn abort_peer(&self, peer: &Arc<Peer>) {
        self.peers.remove(peer);
        peer.abort();
    }

    /// Returns the number of outbound peers, inbound peers and dials in flight.
    pub fn num_peers(&self) -> (usize, usize, usize) {
        let (outbound, inbound): (Vec<_>, Vec<_>) =
            self.peers.list().into_iter().partition(|peer| peer.is_outbound());

        (outbound.len(), inbound.len(), self.dialing.len())
    }

    /// Sends the message to every peer, returning how many accepted it.
    pub fn broadcast(&self, channel: u8, bytes: Bytes) -> usize {
        self.peers
            .list()
            .iter()
            .filter(|peer| peer.try_send(channel, bytes.clone()))
            .count()
    }

    /// Refuses connections from the host for `duration`, disconnecting any current peers on it.
    pub fn ban_peer(&self, ip: IpAddr, duration: Duration) {
        let until = OffsetDateTime::now_utc() + duration;
        self.banned.insert(ip, until);
        info!(ip = %ip, until = %until, "banned host");

        for peer in self.peers.list() {
            if peer.remote_addr_host() == Some(ip) {
                self.stop_peer_for_error(&peer, "banned");
            }
        }
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let now = OffsetDateTime::now_utc();
        self.banned.remove_if(&ip, |_, until| *until <= now);

        self.banned.contains_key(&ip)
    }
}
