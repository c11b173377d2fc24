//! Node configuration.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    core::addr::NetAddress,
    error::{AddrError, ConfigError},
    peer::PeerConfig,
};

/// Configuration of the peer-to-peer layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory relative paths are resolved against.
    pub root_dir: PathBuf,
    /// Address to accept connections on, `ip:port` with an optional `tcp://` prefix.
    pub listen_address: String,
    /// Comma separated seed addresses, dialed when the node has too few peers.
    pub seeds: String,
    /// Address book file.
    pub addr_book_file: PathBuf,
    /// Refuse and segregate local and non-routable addresses in the address book.
    pub addr_book_strict: bool,
    /// Run the peer exchange reactor.
    pub pex: bool,
    /// Inbound connections are refused beyond this many peers.
    pub max_num_peers: usize,
    /// Handshake timeout, in seconds.
    pub handshake_timeout: u64,
    /// Dial timeout, in seconds.
    pub dial_timeout: u64,
    /// Human readable node name.
    pub moniker: String,
    /// Peers on other networks are refused.
    pub network: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            listen_address: "0.0.0.0:46656".to_string(),
            seeds: String::new(),
            addr_book_file: PathBuf::from("addrbook.json"),
            addr_book_strict: true,
            pex: true,
            max_num_peers: 50,
            handshake_timeout: 30,
            dial_timeout: 3,
            moniker: "anonymous".to_string(),
            network: "switchboard".to_string(),
        }
    }
}

impl Config {
    /// Reads a TOML configuration file, unspecified fields take their default values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;

        // Surface malformed addresses at load time rather than on first use.
        config.listen_net_address()?;
        config.seed_addresses()?;

        Ok(config)
    }

    /// The address book file, resolved against the root directory.
    pub fn addr_book_path(&self) -> PathBuf {
        self.root_dir.join(&self.addr_book_file)
    }

    pub fn listen_net_address(&self) -> Result<NetAddress, AddrError> {
        self.listen_address.parse()
    }

    pub fn seed_addresses(&self) -> Result<Vec<NetAddress>, AddrError> {
        NetAddress::parse_list(&self.seeds)
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            dial_timeout: Duration::from_secs(self.dial_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(config.listen_net_address().unwrap().port, 46656);
        assert_eq!(config.addr_book_path(), PathBuf::from("./addrbook.json"));
        assert!(config.addr_book_strict);
        assert!(config.pex);
        assert_eq!(config.max_num_peers, 50);
        assert_eq!(
            config.peer_config(),
            PeerConfig {
                handshake_timeout: Duration::from_secs(30),
                dial_timeout: Duration::from_secs(3),
            }
        );
        assert!(config.seed_addresses().unwrap().is_empty());
    }

    #[test]
    fn load_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            root_dir = "/var/lib/node"
            listen_address = "tcp://127.0.0.1:26656"
            seeds = "1.2.3.4:4001,5.6.7.8:4001"
            dial_timeout = 10
            "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.addr_book_path(), PathBuf::from("/var/lib/node/addrbook.json"));
        assert_eq!(config.listen_net_address().unwrap().to_string(), "127.0.0.1:26656");
        assert_eq!(config.seed_addresses().unwrap().len(), 2);
        assert_eq!(config.peer_config().dial_timeout, Duration::from_secs(10));
        assert_eq!(config.max_num_peers, 50);
    }

    #[test]
    fn load_rejects_bad_seeds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"seeds = "1.2.3.4:4001,nonsense""#).unwrap();

        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Addr(_))
        ));
    }
}
