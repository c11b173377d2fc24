use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamMap};
use tokio_util::{
    codec::{Framed, FramedParts},
    sync::CancellationToken,
};
use tracing::*;

use super::conn::BoxedStream;
use crate::codec::ChannelCodec;

/// Describes one logical channel multiplexed over a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub id: u8,
    /// Relative priority, informational.
    pub priority: u8,
    /// The number of outbound messages that may be queued before `try_send` starts refusing.
    pub send_queue_capacity: usize,
    /// The largest inbound message accepted on the channel, in bytes.
    pub recv_message_capacity: usize,
}

impl ChannelDescriptor {
    pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1;
    pub const DEFAULT_RECV_MESSAGE_CAPACITY: usize = 22020096;

    pub fn new(id: u8) -> Self {
        Self {
            id,
            priority: 1,
            send_queue_capacity: Self::DEFAULT_SEND_QUEUE_CAPACITY,
            recv_message_capacity: Self::DEFAULT_RECV_MESSAGE_CAPACITY,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    pub fn with_recv_message_capacity(mut self, capacity: usize) -> Self {
        self.recv_message_capacity = capacity;
        self
    }
}

// State held between construction and `start`.
struct Pending {
    framed: Framed<BoxedStream, ChannelCodec>,
    outbound: StreamMap<u8, ReceiverStream<Bytes>>,
    recv_limits: HashMap<u8, usize>,
}

/// A connection carrying several independent channels.
///
/// Outbound messages are queued per channel and written by a single I/O task, which also decodes
/// inbound frames and hands them to the receive callback. Messages may be queued before the I/O
/// task is started, they are written once it is.
pub struct MConnection {
    senders: HashMap<u8, mpsc::Sender<Bytes>>,
    /// The largest payload the codec will frame, in either direction.
    max_payload: usize,
    pending: Mutex<Option<Pending>>,
    shutdown: CancellationToken,
}

impl MConnection {
    /// Wraps an established stream; `read_buf` holds any bytes already read past the handshake.
    pub fn new(stream: BoxedStream, read_buf: BytesMut, channels: &[ChannelDescriptor]) -> Self {
        let max_payload = channels
            .iter()
            .map(|ch| ch.recv_message_capacity)
            .max()
            .unwrap_or(0);

        let mut parts = FramedParts::new::<(u8, Bytes)>(stream, ChannelCodec::new(max_payload));
        parts.read_buf = read_buf;
        let framed = Framed::from_parts(parts);

        let mut senders = HashMap::with_capacity(channels.len());
        let mut outbound = StreamMap::with_capacity(channels.len());
        let mut recv_limits = HashMap::with_capacity(channels.len());

        for ch in channels {
            let (tx, rx) = mpsc::channel(ch.send_queue_capacity.max(1));
            senders.insert(ch.id, tx);
            outbound.insert(ch.id, ReceiverStream::new(rx));
            recv_limits.insert(ch.id, ch.recv_message_capacity);
        }

        Self {
            senders,
            max_payload,
            pending: Mutex::new(Some(Pending {
                framed,
                outbound,
                recv_limits,
            })),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawns the I/O task. Subsequent calls, and calls after [`stop`](Self::stop), are no-ops.
    ///
    /// `on_receive` is called for every inbound message, in order. `on_error` is called at most
    /// once, if the connection fails for any reason other than being stopped.
    pub fn start<R, E>(&self, mut on_receive: R, on_error: E)
    where
        R: FnMut(u8, Bytes) + Send + 'static,
        E: FnOnce(String) + Send + 'static,
    {
        let Pending {
            framed,
            mut outbound,
            recv_limits,
        } = match self.pending.lock().take() {
            Some(pending) => pending,
            None => return,
        };
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let (mut sink, mut stream) = framed.split();

            let failure = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break None,

                    Some((channel, bytes)) = outbound.next() => {
                        if let Err(e) = sink.send((channel, bytes)).await {
                            break Some(format!("send error: {e}"));
                        }
                    }

                    frame = stream.next() => match frame {
                        Some(Ok((channel, bytes))) => match recv_limits.get(&channel) {
                            None => break Some(format!("unknown channel {channel:#04x}")),
                            Some(&limit) if bytes.len() > limit => {
                                break Some(format!(
                                    "message of {} bytes exceeds the {limit} byte limit of channel {channel:#04x}",
                                    bytes.len()
                                ));
                            }
                            Some(_) => on_receive(channel, bytes),
                        },
                        Some(Err(e)) => break Some(format!("receive error: {e}")),
                        None => break Some("connection closed".to_string()),
                    },
                }
            };

            if let Some(reason) = failure {
                if !shutdown.is_cancelled() {
                    trace!(reason = %reason, "connection failed");
                    on_error(reason);
                }
            }
        });
    }

    /// Queues a message without blocking, returning `false` if the channel is unknown, its queue
    /// is full, the message is too large to frame or the connection is stopped.
    pub fn try_send(&self, channel: u8, bytes: Bytes) -> bool {
        if self.shutdown.is_cancelled() || bytes.len() > self.max_payload {
            return false;
        }

        match self.senders.get(&channel) {
            Some(tx) => tx.try_send(bytes).is_ok(),
            None => false,
        }
    }

    /// Stops the I/O task and closes the stream.
    pub fn stop(&self) {
        self.shutdown.cancel();
        // Drops the stream if the task was never started.
        self.pending.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    fn pair(
        a_channels: &[ChannelDescriptor],
        b_channels: &[ChannelDescriptor],
    ) -> (MConnection, MConnection) {
        let (a, b) = tokio::io::duplex(1024);
        (
            MConnection::new(Box::new(a), BytesMut::new(), a_channels),
            MConnection::new(Box::new(b), BytesMut::new(), b_channels),
        )
    }

    #[tokio::test]
    async fn send_and_receive() {
        let channels = [ChannelDescriptor::new(0x01), ChannelDescriptor::new(0x02)];
        let (a, b) = pair(&channels, &channels);

        let (tx, mut rx) = mpsc::unbounded_channel();
        a.start(|_, _| {}, |_| {});
        b.start(move |ch, bytes| tx.send((ch, bytes)).unwrap(), |_| {});

        assert!(a.try_send(0x01, Bytes::from_static(b"one")));
        assert_eq!(rx.recv().await.unwrap(), (0x01, Bytes::from_static(b"one")));

        assert!(a.try_send(0x02, Bytes::from_static(b"two")));
        assert_eq!(rx.recv().await.unwrap(), (0x02, Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn queued_before_start() {
        let channels = [ChannelDescriptor::new(0x01).with_send_queue_capacity(2)];
        let (a, b) = pair(&channels, &channels);

        assert!(a.try_send(0x01, Bytes::from_static(b"early")));

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.start(move |ch, bytes| tx.send((ch, bytes)).unwrap(), |_| {});
        a.start(|_, _| {}, |_| {});

        assert_eq!(rx.recv().await.unwrap(), (0x01, Bytes::from_static(b"early")));
    }

    #[tokio::test]
    async fn try_send_refusals() {
        let channels = [ChannelDescriptor::new(0x01)];
        let (a, _b) = pair(&channels, &channels);

        assert!(!a.try_send(0x09, Bytes::new()));

        // The queue holds a single message until the connection starts.
        assert!(a.try_send(0x01, Bytes::new()));
        assert!(!a.try_send(0x01, Bytes::new()));

        a.stop();
        assert!(a.is_stopped());
        assert!(!a.try_send(0x01, Bytes::new()));
    }

    #[tokio::test]
    async fn try_send_refuses_unframeable_messages() {
        let channels = [
            ChannelDescriptor::new(0x01).with_recv_message_capacity(4),
            ChannelDescriptor::new(0x02).with_recv_message_capacity(16),
        ];
        let (a, b) = pair(&channels, &channels);

        let (tx, mut rx) = mpsc::unbounded_channel();
        a.start(|_, _| {}, |_| {});
        b.start(move |ch, bytes| tx.send((ch, bytes)).unwrap(), |_| {});

        // The frame limit is the largest capacity of any channel.
        assert!(!a.try_send(0x02, Bytes::from(vec![0u8; 17])));

        // The connection survives the refusal.
        assert!(a.try_send(0x02, Bytes::from(vec![0u8; 16])));
        assert_eq!(rx.recv().await.unwrap().1.len(), 16);
        assert!(!a.is_stopped());
    }

    #[tokio::test]
    async fn unknown_channel_is_an_error() {
        let (a, b) = pair(
            &[ChannelDescriptor::new(0x01), ChannelDescriptor::new(0x02)],
            &[ChannelDescriptor::new(0x01)],
        );

        let (tx, rx) = oneshot::channel();
        a.start(|_, _| {}, |_| {});
        b.start(|_, _| {}, move |reason| tx.send(reason).unwrap());

        assert!(a.try_send(0x02, Bytes::from_static(b"nope")));
        let reason = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(reason.contains("unknown channel"));
    }

    #[tokio::test]
    async fn oversized_message_is_an_error() {
        let (a, b) = pair(
            &[ChannelDescriptor::new(0x01)],
            &[
                ChannelDescriptor::new(0x01).with_recv_message_capacity(4),
                ChannelDescriptor::new(0x02).with_recv_message_capacity(64),
            ],
        );

        let (tx, rx) = oneshot::channel();
        a.start(|_, _| {}, |_| {});
        b.start(|_, _| {}, move |reason| tx.send(reason).unwrap());

        assert!(a.try_send(0x01, Bytes::from_static(b"far too long")));
        let reason = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(reason.contains("exceeds"));
    }

    #[tokio::test]
    async fn remote_close_is_reported() {
        let channels = [ChannelDescriptor::new(0x01)];
        let (a, b) = pair(&channels, &channels);

        let (tx, rx) = oneshot::channel();
        b.start(|_, _| {}, move |reason| tx.send(reason).unwrap());
        a.stop();

        let reason = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, "connection closed");
    }
}
