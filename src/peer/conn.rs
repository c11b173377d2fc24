use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_util::codec::Framed;
use tracing::*;

use crate::{
    codec::NodeInfoCodec,
    core::{addr::NetAddress, id::NodeKey, id::PubKey, node_info::NodeInfo},
    error::{HandshakeError, SwitchError},
};

/// A duplex byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Upgrades a raw connection into an authenticated, encrypted one.
#[async_trait]
pub trait SecureTransport: Send + Sync + 'static {
    async fn upgrade(&self, raw: BoxedStream, local_key: &NodeKey) -> io::Result<BoxedStream>;
}

/// A transport that hands the raw connection back untouched.
///
/// Peers are still identified by the key in their identity document, but nothing binds that key
/// to the connection: only use this on trusted networks and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct Plaintext;

#[async_trait]
impl SecureTransport for Plaintext {
    async fn upgrade(&self, raw: BoxedStream, _local_key: &NodeKey) -> io::Result<BoxedStream> {
        Ok(raw)
    }
}

/// Per-connection timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerConfig {
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(3),
        }
    }
}

/// A connection on its way to becoming a [`Peer`](super::Peer).
pub struct PeerConn {
    stream: BoxedStream,
    /// Bytes read past the identity document.
    read_buf: BytesMut,
    outbound: bool,
    socket_addr: SocketAddr,
    /// The identity we expect to answer, if we dialed an address carrying one.
    expected_id: Option<PubKey>,
    config: PeerConfig,
}

impl PeerConn {
    /// Dials the address, giving up after the configured dial timeout.
    pub async fn dial(addr: &NetAddress, config: PeerConfig) -> Result<Self, SwitchError> {
        let socket_addr = addr.socket_addr();

        let stream =
            match tokio::time::timeout(config.dial_timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(SwitchError::Dial {
                        addr: addr.clone(),
                        source,
                    })
                }
                Err(_) => return Err(SwitchError::DialTimeout(addr.clone())),
            };
        let _ = stream.set_nodelay(true);

        Ok(Self::new(Box::new(stream), socket_addr, true, config).with_expected_id(addr.id))
    }

    /// Wraps an accepted connection.
    pub fn inbound(stream: TcpStream, socket_addr: SocketAddr, config: PeerConfig) -> Self {
        let _ = stream.set_nodelay(true);
        Self::new(Box::new(stream), socket_addr, false, config)
    }

    /// Wraps an arbitrary stream, useful to drive connections over in-memory pipes.
    pub fn new(stream: BoxedStream, socket_addr: SocketAddr, outbound: bool, config: PeerConfig) -> Self {
        Self {
            stream,
            read_buf: BytesMut::new(),
            outbound,
            socket_addr,
            expected_id: None,
            config,
        }
    }

    pub fn with_expected_id(mut self, id: Option<PubKey>) -> Self {
        self.expected_id = id;
        self
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// The address of the remote end of the socket.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    pub fn expected_id(&self) -> Option<PubKey> {
        self.expected_id
    }

    pub fn config(&self) -> PeerConfig {
        self.config
    }

    /// Runs the stream through the secure transport.
    pub async fn upgrade(
        mut self,
        transport: &dyn SecureTransport,
        local_key: &NodeKey,
    ) -> Result<Self, SwitchError> {
        self.stream = transport
            .upgrade(self.stream, local_key)
            .await
            .map_err(SwitchError::Upgrade)?;

        Ok(self)
    }

    /// Exchanges identity documents with the remote.
    ///
    /// Both sides write and read at the same time, so neither blocks on the other reading first.
    /// Both directions share the handshake deadline and a failure in either aborts the other. On
    /// success the remote's document is returned with `remote_addr` set to the address actually
    /// observed.
    pub async fn handshake(mut self, our_info: &NodeInfo) -> Result<(Self, NodeInfo), HandshakeError> {
        let framed = Framed::new(self.stream, NodeInfoCodec::new());
        let (mut sink, mut stream) = framed.split();

        let exchange = async {
            let write = async {
                sink.send(our_info.clone()).await?;
                Ok::<_, HandshakeError>(())
            };
            let read = async {
                match stream.next().await {
                    Some(Ok(info)) => Ok(info),
                    Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                        Err(HandshakeError::Invalid(e.to_string()))
                    }
                    Some(Err(e)) => Err(HandshakeError::Io(e)),
                    None => Err(HandshakeError::Closed),
                }
            };

            tokio::try_join!(write, read)
        };

        let ((), mut their_info): ((), NodeInfo) =
            match tokio::time::timeout(self.config.handshake_timeout, exchange).await {
                Ok(res) => res?,
                Err(_) => return Err(HandshakeError::Timeout),
            };

        let framed = sink
            .reunite(stream)
            .map_err(|_| HandshakeError::Invalid("handshake halves don't match".to_string()))?;
        let parts = framed.into_parts();

        self.stream = parts.io;
        self.read_buf = parts.read_buf;

        their_info.remote_addr = Some(self.socket_addr);
        trace!(peer = %their_info.pub_key, addr = %self.socket_addr, "handshake complete");

        Ok((self, their_info))
    }

    /// Hands over the stream and any bytes already read from it.
    pub(crate) fn into_parts(self) -> (BoxedStream, BytesMut) {
        (self.stream, self.read_buf)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::core::node_info::MAX_NODE_INFO_SIZE;

    fn node_info(n: u16) -> NodeInfo {
        NodeInfo {
            pub_key: PubKey::from_u16(n),
            moniker: format!("node-{n}"),
            network: "testnet".to_string(),
            remote_addr: None,
            listen_addr: format!("127.0.0.1:{}", 4000 + n).parse().unwrap(),
            version: "0.1.0".to_string(),
            other: vec![],
        }
    }

    fn conn(stream: BoxedStream, port: u16, outbound: bool, timeout: Duration) -> PeerConn {
        PeerConn::new(
            stream,
            format!("127.0.0.1:{port}").parse().unwrap(),
            outbound,
            PeerConfig {
                handshake_timeout: timeout,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn handshake_exchanges_identities() {
        let (a, b) = tokio::io::duplex(64);
        let a = conn(Box::new(a), 5001, true, Duration::from_secs(5));
        let b = conn(Box::new(b), 5002, false, Duration::from_secs(5));

        // The pipe is smaller than either document, writing before reading would deadlock.
        let (info_a, info_b) = (node_info(1), node_info(2));
        let (res_a, res_b) = tokio::join!(a.handshake(&info_a), b.handshake(&info_b));
        let (_, theirs_a) = res_a.unwrap();
        let (_, theirs_b) = res_b.unwrap();

        assert_eq!(theirs_a.pub_key, PubKey::from_u16(2));
        assert_eq!(theirs_a.remote_addr, Some("127.0.0.1:5001".parse().unwrap()));
        assert_eq!(theirs_b.pub_key, PubKey::from_u16(1));
        assert_eq!(theirs_b.remote_addr, Some("127.0.0.1:5002".parse().unwrap()));
    }

    #[tokio::test]
    async fn handshake_keeps_trailing_bytes() {
        let (a, mut b) = tokio::io::duplex(MAX_NODE_INFO_SIZE * 2);
        let a = conn(Box::new(a), 5001, true, Duration::from_secs(5));

        // Write the remote document and the first application frame in one go.
        let mut codec_buf = BytesMut::new();
        tokio_util::codec::Encoder::encode(&mut NodeInfoCodec::new(), node_info(2), &mut codec_buf)
            .unwrap();
        codec_buf.put_slice(b"trailing");
        b.write_all(&codec_buf).await.unwrap();

        let (a, _) = a.handshake(&node_info(1)).await.unwrap();
        let (_, read_buf) = a.into_parts();
        assert_eq!(&read_buf[..], b"trailing");

        // Our own document made it to the other side.
        let mut len = [0u8; 4];
        b.read_exact(&mut len).await.unwrap();
        assert!(u32::from_be_bytes(len) > 0);
    }

    #[tokio::test]
    async fn handshake_times_out() {
        let (a, _b) = tokio::io::duplex(MAX_NODE_INFO_SIZE * 2);
        let a = conn(Box::new(a), 5001, true, Duration::from_millis(50));

        assert!(matches!(
            a.handshake(&node_info(1)).await,
            Err(HandshakeError::Timeout)
        ));
    }

    #[tokio::test]
    async fn handshake_rejects_garbage() {
        let (a, mut b) = tokio::io::duplex(MAX_NODE_INFO_SIZE * 2);
        let a = conn(Box::new(a), 5001, true, Duration::from_secs(5));

        b.write_all(&[0, 0, 0, 3, 0xff, 0xff, 0xff]).await.unwrap();
        assert!(matches!(
            a.handshake(&node_info(1)).await,
            Err(HandshakeError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn handshake_remote_closed() {
        let (a, b) = tokio::io::duplex(MAX_NODE_INFO_SIZE * 2);
        let a = conn(Box::new(a), 5001, true, Duration::from_secs(5));
        drop(b);

        assert!(a.handshake(&node_info(1)).await.is_err());
    }

    #[tokio::test]
    async fn dial_refused() {
        // Grab a free port and release it again.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = NetAddress::from(listener.local_addr().unwrap());
        drop(listener);

        assert!(matches!(
            PeerConn::dial(&addr, PeerConfig::default()).await,
            Err(SwitchError::Dial { .. }) | Err(SwitchError::DialTimeout(_))
        ));
    }
}
