use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{error::ReactorError, peer::ChannelDescriptor, peer::Peer, switch::Switch};

/// A protocol handler plugged into the [`Switch`].
///
/// Each reactor owns a fixed set of channels, the switch routes every inbound frame on one of
/// those channels to [`receive`](Reactor::receive). The set of reactors (and therefore channels)
/// is fixed when the switch is constructed.
///
/// All hooks are called from the switch's tasks and must not block, long running work should be
/// spawned onto the runtime.
pub trait Reactor: Send + Sync + 'static {
    /// A short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// The channels this reactor owns.
    fn channels(&self) -> Vec<ChannelDescriptor>;

    /// Hands the reactor a handle to the switch it is registered with; the provided
    /// implementation discards it.
    fn set_switch(&self, _switch: Weak<Switch>) {}

    /// Starts any background work, `shutdown` is cancelled when the switch stops; the provided
    /// implementation is a no-op.
    fn start(self: Arc<Self>, _shutdown: CancellationToken) {}

    /// Called once the switch has stopped every peer; the provided implementation is a no-op.
    fn stop(&self) {}

    /// Called when a peer connects, before any of its messages are dispatched. Returning an error
    /// refuses the peer.
    fn add_peer(&self, _peer: &Arc<Peer>) -> Result<(), ReactorError> {
        Ok(())
    }

    /// Called when a peer is about to be removed; the peer is still registered at this point.
    fn remove_peer(&self, _peer: &Arc<Peer>, _reason: &str) {}

    /// Handles a message received on one of the reactor's channels. Returning an error stops the
    /// peer.
    fn receive(&self, channel: u8, peer: &Arc<Peer>, bytes: Bytes) -> Result<(), ReactorError>;
}
