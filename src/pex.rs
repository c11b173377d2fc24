//! The peer exchange reactor.
//!
//! It keeps the number of outbound peers above [`MIN_OUTBOUND_PEERS`] by dialing addresses drawn
//! from the address book, and keeps the book itself stocked by asking connected peers for the
//! addresses they know about.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use rand::{seq::SliceRandom, thread_rng};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{
    book::{SyncAddrBook, SAVE_PERIOD},
    core::{
        addr::NetAddress,
        message::{PexMessage, PEX_CHANNEL},
        traits::Reactor,
    },
    error::ReactorError,
    peer::{ChannelDescriptor, Peer},
    switch::Switch,
};

/// The outbound peer count the reactor works towards.
pub const MIN_OUTBOUND_PEERS: usize = 5;
/// Below this many peers the quick ticker triggers a pass and the seeds are dialed.
pub const MIN_PEERS: usize = 3;
/// Messages a single peer may send per flush period before it is disconnected.
pub const MAX_MSG_COUNT_BY_PEER: u16 = 1000;

// Dial this many times the missing peer count, some dials are expected to fail.
const DIAL_FACTOR: usize = 3;
// The bias towards new addresses stops growing at this many outbound peers.
const MAX_BIAS_PEERS: usize = 8;

/// Maintenance cadence of the [`PexReactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PexConfig {
    /// Period of the full [`ensure_peers`](PexReactor::ensure_peers) pass.
    pub ensure_peers_period: Duration,
    /// Period of the check triggering a pass when connectivity drops below [`MIN_PEERS`].
    pub quick_period: Duration,
    /// Period after which the per-peer message counters are reset.
    pub flush_period: Duration,
}

impl Default for PexConfig {
    fn default() -> Self {
        Self {
            ensure_peers_period: Duration::from_secs(120),
            quick_period: Duration::from_secs(3),
            flush_period: Duration::from_secs(60 * 60),
        }
    }
}

/// Exchanges addresses with peers and dials new ones.
pub struct PexReactor {
    book: SyncAddrBook,
    config: PexConfig,
    switch: RwLock<Weak<Switch>>,
    /// Messages received per peer key since the last flush.
    msg_count_by_peer: DashMap<String, u16>,
    /// Peers we've asked for addresses and haven't answered yet.
    requested: DashSet<String>,
}

impl PexReactor {
    pub fn new(book: SyncAddrBook, config: PexConfig) -> Self {
        Self {
            book,
            config,
            switch: RwLock::new(Weak::new()),
            msg_count_by_peer: DashMap::new(),
            requested: DashSet::new(),
        }
    }

    pub fn book(&self) -> &SyncAddrBook {
        &self.book
    }

    fn switch(&self) -> Option<Arc<Switch>> {
        self.switch.read().upgrade()
    }

    /// Asks the peer for addresses, unless a request is already outstanding. A peer whose queue
    /// is full is disconnected.
    pub fn request_addrs(&self, peer: &Arc<Peer>) {
        if !self.requested.insert(peer.key().to_string()) {
            return;
        }

        if !peer.try_send(PEX_CHANNEL, PexMessage::Request.to_bytes()) {
            self.requested.remove(peer.key());
            debug!(peer = %peer, "pex queue full, dropping peer");
            if let Some(switch) = self.switch() {
                switch.stop_peer_gracefully(peer);
            }
        }
    }

    /// Dials as many addresses as needed to get back to [`MIN_OUTBOUND_PEERS`].
    ///
    /// Every dial of the pass is awaited and its outcome recorded in the book before the book is
    /// checked for being short on addresses.
    pub async fn ensure_peers(&self) {
        let switch = match self.switch() {
            Some(switch) => switch,
            None => return,
        };

        let (outbound, _, dialing) = switch.num_peers();
        let num_to_dial = MIN_OUTBOUND_PEERS.saturating_sub(outbound + dialing) * DIAL_FACTOR;

        debug!(outbound, dialing, num_to_dial, "ensuring peers");

        if num_to_dial > 0 {
            // The bias is the preference for new addresses, a better connected node explores
            // more untried ones.
            let bias = (outbound.min(MAX_BIAS_PEERS) * 10 + 10) as i32;
            let connected: Vec<_> = switch
                .peers()
                .list()
                .iter()
                .filter_map(|peer| peer.remote_addr_host())
                .collect();

            let mut to_dial = HashMap::new();
            for _ in 0..num_to_dial * DIAL_FACTOR {
                if to_dial.len() >= num_to_dial {
                    break;
                }

                let candidate = match self.book.pick_address(bias) {
                    Some(candidate) => candidate,
                    None => continue,
                };

                if to_dial.contains_key(&candidate.ip)
                    || switch.is_dialing(&candidate)
                    || connected.contains(&candidate.ip)
                {
                    continue;
                }

                to_dial.insert(candidate.ip, candidate);
            }

            let mut dials = JoinSet::new();
            for addr in to_dial.into_values() {
                let switch = switch.clone();
                dials.spawn(async move {
                    let res = switch.dial_peer_with_address(&addr).await;
                    (addr, res)
                });
            }

            while let Some(joined) = dials.join_next().await {
                let (addr, res) = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(error = %e, "dial task failed");
                        continue;
                    }
                };

                match res {
                    Ok(_) => self.book.mark_good(&addr),
                    Err(e) => {
                        debug!(addr = %addr, error = %e, "dial failed");
                        self.book.mark_attempt(&addr);
                    }
                }
            }
        }

        if self.book.need_more_addrs() {
            let peers = switch.peers().list();
            if let Some(peer) = peers.choose(&mut thread_rng()) {
                self.request_addrs(peer);
            }
        }
    }

    /// Adds the seeds to the book and dials every other one of them in random order.
    ///
    /// Our own address is never dialed, even if it is listed as a seed.
    pub async fn dial_seeds(&self, seeds: &[NetAddress]) {
        let switch = match self.switch() {
            Some(switch) => switch,
            None => return,
        };

        let our_addr = switch.listen_net_address();
        let mut seeds: Vec<_> = seeds
            .iter()
            .filter(|seed| **seed != our_addr)
            .cloned()
            .collect();

        for seed in &seeds {
            if let Err(e) = self.book.add_address(seed, &our_addr) {
                debug!(seed = %seed, error = %e, "seed not added to the book");
            }
        }
        if let Err(e) = self.book.save() {
            warn!(error = %e, "failed to save the address book");
        }

        seeds.shuffle(&mut thread_rng());

        let mut dials = JoinSet::new();
        for seed in seeds.into_iter().step_by(2) {
            let switch = switch.clone();
            dials.spawn(async move {
                if let Err(e) = switch.dial_peer_with_address(&seed).await {
                    warn!(seed = %seed, error = %e, "failed to dial seed");
                }
            });
        }

        while dials.join_next().await.is_some() {}
    }

    async fn ensure_peers_routine(
        self: Arc<Self>,
        seeds: Vec<NetAddress>,
        shutdown: CancellationToken,
    ) {
        self.ensure_peers().await;
        if self.num_peers() < MIN_PEERS {
            self.dial_seeds(&seeds).await;
        }

        let mut ticker = tokio::time::interval(self.config.ensure_peers_period);
        let mut quick_ticker = tokio::time::interval(self.config.quick_period);
        // Both complete immediately the first time.
        ticker.tick().await;
        quick_ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.ensure_peers().await,
                _ = quick_ticker.tick() => {
                    if self.num_peers() < MIN_PEERS {
                        self.ensure_peers().await;
                    }
                }
            }
        }

        debug!("pex routine stopped");
    }

    async fn flush_routine(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.flush_period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.msg_count_by_peer.clear(),
            }
        }
    }

    fn num_peers(&self) -> usize {
        self.switch().map_or(0, |switch| switch.peers().size())
    }

    // Returns `false` once the peer has sent too many messages this period.
    fn count_message(&self, peer: &Peer) -> bool {
        let mut count = self
            .msg_count_by_peer
            .entry(peer.key().to_string())
            .or_insert(0);
        *count = count.saturating_add(1);

        *count < MAX_MSG_COUNT_BY_PEER
    }
}

impl Reactor for PexReactor {
    fn name(&self) -> &'static str {
        "pex"
    }

    fn channels(&self) -> Vec<ChannelDescriptor> {
        vec![ChannelDescriptor::new(PEX_CHANNEL)
            .with_priority(1)
            .with_send_queue_capacity(10)]
    }

    fn set_switch(&self, switch: Weak<Switch>) {
        *self.switch.write() = switch;
    }

    fn start(self: Arc<Self>, shutdown: CancellationToken) {
        let seeds = match self.switch().map(|switch| switch.config().seed_addresses()) {
            Some(Ok(seeds)) => seeds,
            Some(Err(e)) => {
                warn!(error = %e, "ignoring malformed seeds");
                Vec::new()
            }
            None => Vec::new(),
        };

        tokio::spawn(self.clone().ensure_peers_routine(seeds, shutdown.clone()));
        tokio::spawn(self.clone().flush_routine(shutdown.clone()));
        self.book.spawn_save_routine(SAVE_PERIOD, shutdown);
    }

    fn stop(&self) {
        if let Err(e) = self.book.save() {
            warn!(error = %e, "failed to save the address book");
        }
    }

    fn add_peer(&self, peer: &Arc<Peer>) -> Result<(), ReactorError> {
        if peer.is_outbound() {
            if self.book.need_more_addrs() {
                self.request_addrs(peer);
            }
        } else {
            // The peer vouches for its own listener.
            let addr = peer.node_info().listen_net_address();
            if let Err(e) = self.book.add_address(&addr, &addr) {
                debug!(peer = %peer, addr = %addr, error = %e, "listen address not added to the book");
            }
        }

        Ok(())
    }

    fn remove_peer(&self, peer: &Arc<Peer>, _reason: &str) {
        self.msg_count_by_peer.remove(peer.key());
        self.requested.remove(peer.key());
    }

    fn receive(&self, channel: u8, peer: &Arc<Peer>, bytes: Bytes) -> Result<(), ReactorError> {
        debug_assert_eq!(channel, PEX_CHANNEL);

        if !self.count_message(peer) {
            return Err(ReactorError::new(format!(
                "more than {MAX_MSG_COUNT_BY_PEER} pex messages"
            )));
        }

        let message = PexMessage::from_bytes(&bytes)?;
        trace!(peer = %peer, message = message.variant_as_str(), "received pex message");

        match message {
            PexMessage::Request => {
                let selection = PexMessage::Addrs(self.book.get_selection());
                // A full queue drops the answer, the peer can ask again.
                let _ = peer.try_send(PEX_CHANNEL, selection.to_bytes());
            }
            PexMessage::Addrs(addrs) => {
                if self.requested.remove(peer.key()).is_none() {
                    return Err(ReactorError::new("unsolicited pex addresses"));
                }

                let src = peer.node_info().listen_net_address();
                for addr in &addrs {
                    if let Err(e) = self.book.add_address(addr, &src) {
                        trace!(addr = %addr, error = %e, "pex address not added to the book");
                    }
                }
            }
        }

        Ok(())
    }
}
