use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

use super::{AddrBook, KnownAddress};
use crate::{core::addr::NetAddress, error::AddrBookError};

/// How often the book is flushed to disk while running.
pub const SAVE_PERIOD: Duration = Duration::from_secs(2 * 60);

/// An address book suitable for use in async contexts.
///
/// It wraps [`AddrBook`] in a reader/writer lock, selection and size queries share the lock while
/// every mutation (and saving) takes it exclusively. Cloning is cheap, clones share the same book.
#[derive(Debug, Clone)]
pub struct SyncAddrBook {
    book: Arc<RwLock<AddrBook>>,
    file_path: PathBuf,
}

impl SyncAddrBook {
    /// Creates an empty book persisted at `file_path`.
    pub fn new(file_path: impl Into<PathBuf>, routability_strict: bool) -> Self {
        Self::from_book(AddrBook::new(routability_strict), file_path)
    }

    pub fn from_book(book: AddrBook, file_path: impl Into<PathBuf>) -> Self {
        Self {
            book: Arc::new(RwLock::new(book)),
            file_path: file_path.into(),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn add_our_address(&self, addr: NetAddress) {
        self.book.write().add_our_address(addr)
    }

    pub fn our_addresses(&self) -> Vec<NetAddress> {
        self.book.read().our_addresses()
    }

    pub fn add_address(&self, addr: &NetAddress, src: &NetAddress) -> Result<bool, AddrBookError> {
        self.book.write().add_address(addr, src)
    }

    pub fn remove_address(&self, addr: &NetAddress) {
        self.book.write().remove_address(addr)
    }

    pub fn pick_address(&self, bias: i32) -> Option<NetAddress> {
        self.book.read().pick_address(bias)
    }

    pub fn mark_good(&self, addr: &NetAddress) {
        self.book.write().mark_good(addr)
    }

    pub fn mark_attempt(&self, addr: &NetAddress) {
        self.book.write().mark_attempt(addr)
    }

    pub fn mark_bad(&self, addr: &NetAddress) {
        self.book.write().mark_bad(addr)
    }

    pub fn need_more_addrs(&self) -> bool {
        self.book.read().need_more_addrs()
    }

    pub fn size(&self) -> usize {
        self.book.read().size()
    }

    pub fn has_address(&self, addr: &NetAddress) -> bool {
        self.book.read().has_address(addr)
    }

    pub fn known_address(&self, addr: &NetAddress) -> Option<KnownAddress> {
        self.book.read().known_address(addr).cloned()
    }

    pub fn get_selection(&self) -> Vec<NetAddress> {
        self.book.read().get_selection()
    }

    pub fn list_of_known_addresses(&self) -> Vec<KnownAddress> {
        self.book.read().list_of_known_addresses()
    }

    /// Writes the book to its file.
    pub fn save(&self) -> Result<(), AddrBookError> {
        self.book.write().save_to_file(&self.file_path)
    }

    /// Loads the book from its file, returning `Ok(false)` if there is none yet.
    pub fn load(&self) -> Result<bool, AddrBookError> {
        self.book.write().load_from_file(&self.file_path)
    }

    /// Spawns a task saving the book every `period` and once more on shutdown.
    ///
    /// Failed saves are logged, the in-memory book stays authoritative and the next tick retries.
    pub fn spawn_save_routine(&self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let book = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = book.save() {
                            warn!(error = %e, "failed to save the address book");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }

            if let Err(e) = book.save() {
                warn!(error = %e, "failed to save the address book on shutdown");
            }
        })
    }
}
