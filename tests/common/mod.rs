use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use switchboard::{
    book::SyncAddrBook,
    config::Config,
    error::ReactorError,
    peer::{ChannelDescriptor, Peer, Plaintext},
    pex::{PexConfig, PexReactor},
    switch::Switch,
    NetAddress, NodeKey, Reactor,
};
use tempfile::TempDir;
use tracing_subscriber::{fmt, EnvFilter};

#[allow(dead_code)]
pub fn enable_tracing() {
    fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// The channel used by [`Echo`].
#[allow(dead_code)]
pub const ECHO_CHANNEL: u8 = 0x40;

/// Records every message it receives and sends it straight back.
#[allow(dead_code)]
pub struct Echo {
    pub received: Mutex<Vec<Bytes>>,
    recv_capacity: usize,
}

#[allow(dead_code)]
impl Echo {
    /// Accepts messages of up to `recv_capacity` bytes.
    pub fn new(recv_capacity: usize) -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            recv_capacity,
        }
    }
}

impl Default for Echo {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Reactor for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn channels(&self) -> Vec<ChannelDescriptor> {
        vec![ChannelDescriptor::new(ECHO_CHANNEL)
            .with_send_queue_capacity(16)
            .with_recv_message_capacity(self.recv_capacity)]
    }

    fn receive(&self, _channel: u8, peer: &Arc<Peer>, bytes: Bytes) -> Result<(), ReactorError> {
        self.received.lock().push(bytes.clone());

        // Only echo messages that haven't been echoed yet.
        if !bytes.starts_with(b"re:") {
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&bytes);
            peer.try_send(ECHO_CHANNEL, Bytes::from(reply));
        }

        Ok(())
    }
}

/// A switch listening on localhost with its address book in a temporary directory.
pub struct TestNode {
    pub switch: Arc<Switch>,
    pub listen_addr: SocketAddr,
    _dir: TempDir,
}

#[allow(dead_code)]
impl TestNode {
    pub fn config(network: &str) -> Config {
        Config {
            listen_address: "127.0.0.1:0".to_string(),
            addr_book_strict: false,
            network: network.to_string(),
            handshake_timeout: 5,
            ..Default::default()
        }
    }

    /// Starts a node serving the given reactors.
    pub async fn new(config: Config, reactors: Vec<Arc<dyn Reactor>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let book = SyncAddrBook::new(dir.path().join("addrbook.json"), config.addr_book_strict);

        let switch = Switch::new(config, NodeKey::generate(), book, Arc::new(Plaintext), reactors)
            .unwrap();
        let listen_addr = switch.bind().await.unwrap();
        switch.start().unwrap();

        Self {
            switch,
            listen_addr,
            _dir: dir,
        }
    }

    /// Starts a node running peer exchange on a fast schedule.
    pub async fn with_pex(config: Config) -> (Self, Arc<PexReactor>) {
        let dir = tempfile::tempdir().unwrap();
        let book = SyncAddrBook::new(dir.path().join("addrbook.json"), config.addr_book_strict);
        let pex = Arc::new(PexReactor::new(
            book.clone(),
            PexConfig {
                ensure_peers_period: Duration::from_millis(500),
                quick_period: Duration::from_millis(100),
                flush_period: Duration::from_secs(60),
            },
        ));

        let switch = Switch::new(
            config,
            NodeKey::generate(),
            book,
            Arc::new(Plaintext),
            vec![pex.clone()],
        )
        .unwrap();
        let listen_addr = switch.bind().await.unwrap();
        switch.start().unwrap();

        (
            Self {
                switch,
                listen_addr,
                _dir: dir,
            },
            pex,
        )
    }

    /// Our listener, carrying our identity.
    pub fn net_address(&self) -> NetAddress {
        self.switch.listen_net_address()
    }

    pub fn num_peers(&self) -> usize {
        self.switch.peers().size()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.switch.stop();
    }
}
