use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use super::Peer;
use crate::error::SwitchError;

#[derive(Default)]
struct Inner {
    /// Peer key to the peer and its position in `list`.
    lookup: HashMap<String, (Arc<Peer>, usize)>,
    list: Vec<Arc<Peer>>,
}

/// The registry of active peers.
///
/// Insertion is the single point of deduplication: two connections to the same identity can't
/// both be registered.
#[derive(Default)]
pub struct PeerSet {
    inner: Mutex<Inner>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the peer, failing if its key is taken.
    pub fn add(&self, peer: Arc<Peer>) -> Result<(), SwitchError> {
        let mut inner = self.inner.lock();

        if inner.lookup.contains_key(peer.key()) {
            return Err(SwitchError::DuplicatePeer(peer.key().to_string()));
        }

        let index = inner.list.len();
        inner.list.push(peer.clone());
        inner.lookup.insert(peer.key().to_string(), (peer, index));

        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.lock().lookup.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<Peer>> {
        self.inner.lock().lookup.get(key).map(|(peer, _)| peer.clone())
    }

    /// Unregisters the peer, returning `false` if it wasn't registered.
    ///
    /// The last entry of the list takes the removed entry's place.
    pub fn remove(&self, peer: &Peer) -> bool {
        let mut inner = self.inner.lock();

        let index = match inner.lookup.get(peer.key()) {
            // Another connection under the same key isn't ours to remove.
            Some((registered, index)) if std::ptr::eq(Arc::as_ptr(registered), peer) => *index,
            _ => return false,
        };

        inner.lookup.remove(peer.key());
        inner.list.swap_remove(index);

        if let Some(moved) = inner.list.get(index).cloned() {
            if let Some(entry) = inner.lookup.get_mut(moved.key()) {
                entry.1 = index;
            }
        }

        true
    }

    pub fn size(&self) -> usize {
        self.inner.lock().list.len()
    }

    /// Returns a snapshot of the registered peers.
    pub fn list(&self) -> Vec<Arc<Peer>> {
        self.inner.lock().list.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(port: u16) -> std::net::SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn add_and_remove() {
        let set = PeerSet::new();
        let peers: Vec<_> = (1..=4).map(|i| Peer::mock(i, true, local(i))).collect();

        for peer in &peers {
            set.add(peer.clone()).unwrap();
        }
        assert_eq!(set.size(), 4);

        // Removing from the middle moves the last entry into the gap.
        assert!(set.remove(&peers[1]));
        assert!(!set.remove(&peers[1]));
        assert_eq!(set.size(), 3);
        assert!(!set.has(peers[1].key()));

        let keys: Vec<_> = set.list().iter().map(|p| p.key().to_string()).collect();
        assert_eq!(
            keys,
            vec![
                peers[0].key().to_string(),
                peers[3].key().to_string(),
                peers[2].key().to_string()
            ]
        );

        // The moved entry can still be found and removed.
        assert!(set.remove(&peers[3]));
        assert!(set.get(peers[0].key()).is_some());
        assert!(set.get(peers[3].key()).is_none());
        assert_eq!(set.size(), 2);
    }

    #[tokio::test]
    async fn duplicates_are_rejected() {
        let set = PeerSet::new();
        let first = Peer::mock(1, true, local(1));
        let second = Peer::mock(1, false, local(2));

        set.add(first.clone()).unwrap();
        assert!(matches!(
            set.add(second.clone()),
            Err(SwitchError::DuplicatePeer(_))
        ));

        // The rejected duplicate can't evict the registered peer.
        assert!(!set.remove(&second));
        assert_eq!(set.size(), 1);
        assert!(set.remove(&first));
    }

    #[tokio::test]
    async fn list_is_a_snapshot() {
        let set = PeerSet::new();
        set.add(Peer::mock(1, true, local(1))).unwrap();

        let snapshot = set.list();
        set.add(Peer::mock(2, true, local(2))).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(set.list().len(), 2);
    }
}
