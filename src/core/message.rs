//! Peer exchange message types.

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::{core::addr::NetAddress, error::ReactorError};

/// The channel peer exchange messages travel on.
pub const PEX_CHANNEL: u8 = 0x00;

/// The maximum size of an encoded [`PexMessage`], in bytes.
pub const MAX_PEX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Peer exchange message variants.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum PexMessage {
    /// REQUEST asks the peer for a selection of the addresses it knows about.
    Request,
    /// ADDRS is the only valid response to REQUEST.
    Addrs(Vec<NetAddress>),
}

impl PexMessage {
    pub fn variant_as_str(&self) -> &str {
        match self {
            PexMessage::Request => "request",
            PexMessage::Addrs(_) => "addrs",
        }
    }

    /// Encodes the message for [`Peer::try_send`](crate::peer::Peer::try_send).
    pub fn to_bytes(&self) -> Bytes {
        // Encoding into a `Vec` can't fail for these types.
        let bytes = bincode::encode_to_vec(self, bincode::config::standard()).unwrap_or_default();
        Bytes::from(bytes)
    }

    /// Decodes a message, rejecting oversized and trailing input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReactorError> {
        if bytes.len() > MAX_PEX_MESSAGE_SIZE {
            return Err(ReactorError::new(format!(
                "pex message of {} bytes exceeds the {MAX_PEX_MESSAGE_SIZE} byte limit",
                bytes.len()
            )));
        }

        let config = bincode::config::standard().with_limit::<MAX_PEX_MESSAGE_SIZE>();
        match bincode::decode_from_slice(bytes, config) {
            Ok((message, length)) if length == bytes.len() => Ok(message),
            Ok(_) => Err(ReactorError::new("trailing bytes after pex message")),
            Err(e) => Err(ReactorError::new(format!("malformed pex message: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_as_str() {
        assert_eq!(PexMessage::Request.variant_as_str(), "request");
        assert_eq!(PexMessage::Addrs(vec![]).variant_as_str(), "addrs");
    }

    #[test]
    fn addrs_keep_identities() {
        let id = crate::core::id::PubKey::from_u16(9);
        let addr: NetAddress = format!("{id}@1.2.3.4:4001").parse().unwrap();

        let bytes = PexMessage::Addrs(vec![addr.clone()]).to_bytes();
        match PexMessage::from_bytes(&bytes).unwrap() {
            PexMessage::Addrs(addrs) => {
                assert_eq!(addrs, vec![addr]);
                assert_eq!(addrs[0].id, Some(id));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(PexMessage::from_bytes(&[0xff, 0xff, 0xff]).is_err());

        let mut bytes = PexMessage::Request.to_bytes().to_vec();
        bytes.push(0);
        assert!(PexMessage::from_bytes(&bytes).is_err());
    }
}
