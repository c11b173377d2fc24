//! The identity document exchanged during the handshake.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use bincode::{Decode, Encode};

use crate::{
    core::{addr::NetAddress, id::PubKey},
    error::CompatibilityError,
};

/// The maximum size of an encoded [`NodeInfo`], in bytes.
pub const MAX_NODE_INFO_SIZE: usize = 10240;

/// A node's self-description, sent to every peer on connect.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct NodeInfo {
    pub pub_key: PubKey,
    pub moniker: String,
    pub network: String,
    /// The address the connection was actually observed from, filled in locally once the handshake
    /// completes. Whatever the remote sends here is discarded.
    pub remote_addr: Option<SocketAddr>,
    /// The address the node advertises as its listener.
    pub listen_addr: SocketAddr,
    /// `major.minor.patch`.
    pub version: String,
    /// Application specific data.
    pub other: Vec<String>,
}

impl NodeInfo {
    /// Checks the remote identity against ours: versions must be well formed, the major and minor
    /// versions must match and both nodes must be on the same network.
    pub fn compatible_with(&self, other: &NodeInfo) -> Result<(), CompatibilityError> {
        let (our_major, our_minor) = split_version(&self.version)
            .ok_or_else(|| CompatibilityError::OurVersion(self.version.clone()))?;
        let (their_major, their_minor) = split_version(&other.version)
            .ok_or_else(|| CompatibilityError::TheirVersion(other.version.clone()))?;

        if our_major != their_major {
            return Err(CompatibilityError::Major {
                ours: our_major.to_string(),
                theirs: their_major.to_string(),
            });
        }

        if our_minor != their_minor {
            return Err(CompatibilityError::Minor {
                ours: our_minor.to_string(),
                theirs: their_minor.to_string(),
            });
        }

        if self.network != other.network {
            return Err(CompatibilityError::Network {
                ours: self.network.clone(),
                theirs: other.network.clone(),
            });
        }

        Ok(())
    }

    /// The advertised listener as an address book entry.
    pub fn listen_net_address(&self) -> NetAddress {
        NetAddress::from(self.listen_addr).with_id(self.pub_key)
    }

    /// The IP the connection was observed from, if the handshake has completed.
    pub fn remote_addr_host(&self) -> Option<IpAddr> {
        self.remote_addr.map(|addr| addr.ip())
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeInfo{{pk: {}, moniker: {}, network: {} [listen {}], version: {} ({:?})}}",
            self.pub_key, self.moniker, self.network, self.listen_addr, self.version, self.other
        )
    }
}

fn split_version(version: &str) -> Option<(&str, &str)> {
    let mut parts = version.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(major), Some(minor), Some(_patch), None) => Some((major, minor)),
        _ => None,
    }
}
