//! Wire codecs: identity documents during the handshake, channel frames afterwards.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::core::node_info::{NodeInfo, MAX_NODE_INFO_SIZE};

/// Length-delimited, bincode encoded [`NodeInfo`] documents.
pub struct NodeInfoCodec {
    codec: LengthDelimitedCodec,
}

impl NodeInfoCodec {
    pub fn new() -> Self {
        Self {
            codec: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_NODE_INFO_SIZE)
                .new_codec(),
        }
    }
}

impl Default for NodeInfoCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NodeInfoCodec {
    type Item = NodeInfo;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let bytes = match self.codec.decode(src)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        match bincode::decode_from_slice(&bytes, bincode::config::standard()) {
            Ok((info, _length)) => Ok(Some(info)),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

impl Encoder<NodeInfo> for NodeInfoCodec {
    type Error = io::Error;

    fn encode(&mut self, info: NodeInfo, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = bincode::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // The inner codec enforces the size limit on encode too.
        self.codec.encode(Bytes::from(bytes), dst)
    }
}

/// Multiplexed channel frames: a length prefix, the channel id, then the payload.
pub struct ChannelCodec {
    codec: LengthDelimitedCodec,
}

impl ChannelCodec {
    /// Creates a codec accepting payloads of up to `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            codec: LengthDelimitedCodec::builder()
                .max_frame_length(max_payload.saturating_add(1))
                .new_codec(),
        }
    }
}

impl Decoder for ChannelCodec {
    type Item = (u8, Bytes);
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut frame = match self.codec.decode(src)? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        if frame.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame is missing its channel id",
            ));
        }

        let channel = frame.get_u8();
        Ok(Some((channel, frame.freeze())))
    }
}

impl Encoder<(u8, Bytes)> for ChannelCodec {
    type Error = io::Error;

    fn encode(&mut self, (channel, payload): (u8, Bytes), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut frame = BytesMut::with_capacity(1 + payload.len());
        frame.put_u8(channel);
        frame.put(payload);

        self.codec.encode(frame.freeze(), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::id::PubKey;

    fn node_info(moniker: String) -> NodeInfo {
        NodeInfo {
            pub_key: PubKey::from_u16(1),
            moniker,
            network: "testnet".to_string(),
            remote_addr: None,
            listen_addr: "127.0.0.1:46656".parse().unwrap(),
            version: "0.1.0".to_string(),
            other: vec!["extra".to_string()],
        }
    }

    #[test]
    fn codec_node_info() {
        let info = node_info("alice".to_string());

        let mut codec = NodeInfoCodec::new();
        let mut dst = BytesMut::new();

        assert!(codec.encode(info.clone(), &mut dst).is_ok());
        assert_eq!(codec.decode(&mut dst).unwrap().unwrap(), info);
    }

    #[test]
    fn node_info_size_limit() {
        let info = node_info("x".repeat(MAX_NODE_INFO_SIZE));

        let mut codec = NodeInfoCodec::new();
        let mut dst = BytesMut::new();
        assert!(codec.encode(info, &mut dst).is_err());

        // A peer announcing an oversized document is rejected before it is buffered.
        let mut src = BytesMut::new();
        src.put_u32(MAX_NODE_INFO_SIZE as u32 + 1);
        assert!(codec.decode(&mut src).is_err());
    }

    #[test]
    fn codec_channel_frames() {
        let mut codec = ChannelCodec::new(16);
        let mut dst = BytesMut::new();

        codec.encode((0x20, Bytes::from_static(b"hello")), &mut dst).unwrap();
        codec.encode((0x21, Bytes::new()), &mut dst).unwrap();

        assert_eq!(
            codec.decode(&mut dst).unwrap(),
            Some((0x20, Bytes::from_static(b"hello")))
        );
        assert_eq!(codec.decode(&mut dst).unwrap(), Some((0x21, Bytes::new())));
        assert_eq!(codec.decode(&mut dst).unwrap(), None);
    }

    #[test]
    fn channel_frame_limits() {
        let mut codec = ChannelCodec::new(4);
        let mut dst = BytesMut::new();
        assert!(codec
            .encode((0x01, Bytes::from_static(b"too long")), &mut dst)
            .is_err());

        // An empty frame carries no channel.
        let mut src = BytesMut::new();
        src.put_u32(0);
        assert!(codec.decode(&mut src).is_err());
    }
}
