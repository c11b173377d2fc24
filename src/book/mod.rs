//! The address book: a bucketed store of every address the node knows about.
//!
//! Addresses start out in "new" buckets and move to "old" buckets once a connection to them
//! succeeds. Bucket placement is keyed by a per-book secret and by the network group of both the
//! address and the peer that introduced it, so one operator can only ever fill a handful of
//! buckets, no matter how many addresses it hands out.

mod known;
mod persist;
mod sync;

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use sha2::{Digest, Sha256};
use tracing::*;

pub use self::{
    known::{BucketType, KnownAddress},
    sync::{SyncAddrBook, SAVE_PERIOD},
};
use crate::{core::addr::NetAddress, error::AddrBookError};

/// Below this many addresses the book asks peers for more.
pub const NEED_ADDRESS_THRESHOLD: usize = 1000;
/// The maximum number of new buckets a single address may occupy.
pub const MAX_NEW_BUCKETS_PER_ADDRESS: usize = 4;

pub const NEW_BUCKET_COUNT: usize = 256;
pub const NEW_BUCKET_SIZE: usize = 64;
/// The number of new buckets a single (address group, source group) pair can land in.
pub const NEW_BUCKETS_PER_GROUP: u64 = 32;

pub const OLD_BUCKET_COUNT: usize = 64;
pub const OLD_BUCKET_SIZE: usize = 64;
/// The number of old buckets a single address group can land in.
pub const OLD_BUCKETS_PER_GROUP: u64 = 4;

/// The minimum number of addresses returned by [`AddrBook::get_selection`], if available.
pub const MIN_GET_SELECTION: usize = 32;
/// The maximum number of addresses returned by [`AddrBook::get_selection`].
pub const MAX_GET_SELECTION: usize = 250;
/// The share of the book returned by [`AddrBook::get_selection`], in percent.
pub const GET_SELECTION_PERCENT: usize = 23;

/// The core address book.
///
/// This type doesn't do any locking of its own, wrap it in a [`SyncAddrBook`] to share it.
#[derive(Debug)]
pub struct AddrBook {
    /// Secret mixed into every bucket computation.
    key: String,
    /// Refuse local and non-routable addresses and group them under sentinel keys.
    routability_strict: bool,
    /// Selection happens under a shared lock, hence the mutex.
    rng: Mutex<StdRng>,
    our_addrs: HashSet<NetAddress>,
    addr_lookup: HashMap<NetAddress, KnownAddress>,
    buckets_new: Vec<Vec<NetAddress>>,
    buckets_old: Vec<Vec<NetAddress>>,
    n_new: usize,
    n_old: usize,
}

impl AddrBook {
    /// Creates an empty book with a random key.
    pub fn new(routability_strict: bool) -> Self {
        Self::with_rng(routability_strict, StdRng::from_entropy())
    }

    /// Creates an empty book whose key and random choices derive from `seed`.
    pub fn with_seed(routability_strict: bool, seed: u64) -> Self {
        Self::with_rng(routability_strict, StdRng::seed_from_u64(seed))
    }

    fn with_rng(routability_strict: bool, mut rng: StdRng) -> Self {
        let key_bytes: [u8; 12] = rng.gen();

        Self {
            key: hex::encode(key_bytes),
            routability_strict,
            rng: Mutex::new(rng),
            our_addrs: HashSet::new(),
            addr_lookup: HashMap::new(),
            buckets_new: vec![Vec::new(); NEW_BUCKET_COUNT],
            buckets_old: vec![Vec::new(); OLD_BUCKET_COUNT],
            n_new: 0,
            n_old: 0,
        }
    }

    /// Returns the secret bucket key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn routability_strict(&self) -> bool {
        self.routability_strict
    }

    /// Returns the number of known addresses.
    pub fn size(&self) -> usize {
        self.n_new + self.n_old
    }

    /// Returns the number of unverified addresses.
    pub fn n_new(&self) -> usize {
        self.n_new
    }

    /// Returns the number of vetted addresses.
    pub fn n_old(&self) -> usize {
        self.n_old
    }

    /// Returns `true` while the book is short of addresses.
    pub fn need_more_addrs(&self) -> bool {
        self.size() < NEED_ADDRESS_THRESHOLD
    }

    pub fn has_address(&self, addr: &NetAddress) -> bool {
        self.addr_lookup.contains_key(addr)
    }

    /// Returns the record for the address, if it is known.
    pub fn known_address(&self, addr: &NetAddress) -> Option<&KnownAddress> {
        self.addr_lookup.get(addr)
    }

    /// Registers one of our own addresses, these are never admitted into the book.
    pub fn add_our_address(&mut self, addr: NetAddress) {
        debug!(addr = %addr, "adding our address");
        self.our_addrs.insert(addr);
    }

    pub fn our_addresses(&self) -> Vec<NetAddress> {
        self.our_addrs.iter().cloned().collect()
    }

    /// Admits `addr`, learnt from `src`, into a new bucket.
    ///
    /// Returns `Ok(false)` if the address was silently skipped: it is already vetted, it already
    /// occupies [`MAX_NEW_BUCKETS_PER_ADDRESS`] buckets or it lost the admission draw. The more
    /// buckets an address occupies, the less likely it is to be admitted into another one.
    pub fn add_address(
        &mut self,
        addr: &NetAddress,
        src: &NetAddress,
    ) -> Result<bool, AddrBookError> {
        if self.our_addrs.contains(addr) {
            return Err(AddrBookError::OwnAddress(addr.clone()));
        }

        if self.routability_strict && !addr.is_routable() {
            return Err(AddrBookError::NonRoutable(addr.clone()));
        }

        let ka = match self.addr_lookup.get(addr) {
            Some(ka) => {
                if ka.is_old() || ka.buckets.len() >= MAX_NEW_BUCKETS_PER_ADDRESS {
                    return Ok(false);
                }

                // Accept with probability 1 / (2 * buckets).
                let factor = 2 * ka.buckets.len() as u32;
                if factor > 0 && self.rng.get_mut().gen_range(0..factor) != 0 {
                    return Ok(false);
                }

                ka.clone()
            }
            None => KnownAddress::new(addr.clone(), src.clone()),
        };

        let bucket_idx = self.calc_new_bucket(addr, src);
        self.add_to_new_bucket(ka, bucket_idx);

        Ok(true)
    }

    /// Picks a random address, `bias` (clamped to `[0, 100]`) sets the preference for new over
    /// vetted addresses.
    pub fn pick_address(&self, bias: i32) -> Option<NetAddress> {
        if self.size() == 0 {
            return None;
        }

        let bias = f64::from(bias.clamp(0, 100));

        // The square roots dampen the effect of one pool dwarfing the other.
        let old_correlation = (self.n_old as f64).sqrt() * (100.0 - bias);
        let new_correlation = (self.n_new as f64).sqrt() * bias;

        let mut rng = self.rng.lock();
        let pick_old =
            (new_correlation + old_correlation) * rng.gen::<f64>() < old_correlation;

        let (buckets, n) = if pick_old {
            (&self.buckets_old, self.n_old)
        } else {
            (&self.buckets_new, self.n_new)
        };

        if n == 0 {
            return None;
        }

        // The pool is non-empty so this terminates.
        loop {
            let bucket = &buckets[rng.gen_range(0..buckets.len())];
            if let Some(addr) = bucket.choose(&mut *rng) {
                return Some(addr.clone());
            }
        }
    }

    /// Records a successful connection, promoting the address to a vetted bucket.
    pub fn mark_good(&mut self, addr: &NetAddress) {
        let is_new = match self.addr_lookup.get_mut(addr) {
            Some(ka) => {
                ka.mark_good();
                ka.is_new()
            }
            None => return,
        };

        if is_new {
            self.move_to_old(addr);
        }
    }

    /// Records a connection attempt.
    pub fn mark_attempt(&mut self, addr: &NetAddress) {
        if let Some(ka) = self.addr_lookup.get_mut(addr) {
            ka.mark_attempt();
        }
    }

    /// Forgets a misbehaving address.
    pub fn mark_bad(&mut self, addr: &NetAddress) {
        self.remove_address(addr);
    }

    /// Removes the address from every bucket it occupies.
    pub fn remove_address(&mut self, addr: &NetAddress) {
        let ka = match self.addr_lookup.get(addr) {
            Some(ka) => ka.clone(),
            None => return,
        };

        for bucket_idx in ka.buckets {
            self.remove_from_bucket(addr, ka.bucket_type, bucket_idx);
        }
    }

    /// Returns a random selection of known addresses to share with a peer.
    pub fn get_selection(&self) -> Vec<NetAddress> {
        let size = self.size();
        if size == 0 {
            return Vec::new();
        }

        let n = MIN_GET_SELECTION
            .min(size)
            .max(size * GET_SELECTION_PERCENT / 100)
            .min(MAX_GET_SELECTION);

        let mut addrs: Vec<_> = self.addr_lookup.keys().cloned().collect();
        let mut rng = self.rng.lock();
        let (selection, _) = addrs.partial_shuffle(&mut *rng, n);

        selection.to_vec()
    }

    /// Returns a snapshot of every known address.
    pub fn list_of_known_addresses(&self) -> Vec<KnownAddress> {
        self.addr_lookup.values().cloned().collect()
    }

    fn add_to_new_bucket(&mut self, mut ka: KnownAddress, bucket_idx: usize) {
        debug_assert!(ka.is_new());

        if self.buckets_new[bucket_idx].contains(&ka.addr) {
            return;
        }

        if self.buckets_new[bucket_idx].len() >= NEW_BUCKET_SIZE {
            self.expire_new(bucket_idx);
        }

        // Eviction may have dropped the record from the lookup, work from the freshest copy.
        if let Some(current) = self.addr_lookup.get(&ka.addr) {
            ka = current.clone();
        }

        if ka.add_bucket_ref(bucket_idx) == Some(1) {
            self.n_new += 1;
        }

        self.buckets_new[bucket_idx].push(ka.addr.clone());
        self.addr_lookup.insert(ka.addr.clone(), ka);
    }

    /// Returns `false` if the bucket is full.
    fn add_to_old_bucket(&mut self, mut ka: KnownAddress, bucket_idx: usize) -> bool {
        debug_assert!(ka.is_old());

        if self.buckets_old[bucket_idx].contains(&ka.addr) {
            return true;
        }

        if self.buckets_old[bucket_idx].len() >= OLD_BUCKET_SIZE {
            return false;
        }

        if ka.add_bucket_ref(bucket_idx) == Some(1) {
            self.n_old += 1;
        }

        self.buckets_old[bucket_idx].push(ka.addr.clone());
        self.addr_lookup.insert(ka.addr.clone(), ka);

        true
    }

    fn remove_from_bucket(&mut self, addr: &NetAddress, bucket_type: BucketType, bucket_idx: usize) {
        let bucket = match bucket_type {
            BucketType::New => &mut self.buckets_new[bucket_idx],
            BucketType::Old => &mut self.buckets_old[bucket_idx],
        };
        bucket.retain(|a| a != addr);

        let ka = match self.addr_lookup.get_mut(addr) {
            Some(ka) => ka,
            None => return,
        };

        if ka.remove_bucket_ref(bucket_idx) == Some(0) {
            self.addr_lookup.remove(addr);
            match bucket_type {
                BucketType::New => self.n_new -= 1,
                BucketType::Old => self.n_old -= 1,
            }
        }
    }

    /// Makes room in a full new bucket: drop a bad address if there is one, the least recently
    /// attempted otherwise.
    fn expire_new(&mut self, bucket_idx: usize) {
        let bucket = &self.buckets_new[bucket_idx];

        let bad = bucket
            .iter()
            .find(|addr| self.addr_lookup.get(*addr).map_or(false, |ka| ka.is_bad()));

        let victim = match bad {
            Some(addr) => addr.clone(),
            None => match self.pick_oldest(BucketType::New, bucket_idx) {
                Some(addr) => addr,
                None => return,
            },
        };

        trace!(addr = %victim, bucket = bucket_idx, "expiring new address");
        self.remove_from_bucket(&victim, BucketType::New, bucket_idx);
    }

    fn pick_oldest(&self, bucket_type: BucketType, bucket_idx: usize) -> Option<NetAddress> {
        let bucket = match bucket_type {
            BucketType::New => &self.buckets_new[bucket_idx],
            BucketType::Old => &self.buckets_old[bucket_idx],
        };

        bucket
            .iter()
            .filter_map(|addr| self.addr_lookup.get(addr))
            .min_by_key(|ka| ka.last_attempt)
            .map(|ka| ka.addr.clone())
    }

    fn move_to_old(&mut self, addr: &NetAddress) {
        let mut ka = match self.addr_lookup.get(addr) {
            Some(ka) if ka.is_new() && !ka.buckets.is_empty() => ka.clone(),
            _ => return,
        };

        let freed_bucket = ka.buckets[0];
        for &bucket_idx in &ka.buckets {
            self.remove_from_bucket(addr, BucketType::New, bucket_idx);
        }

        ka.bucket_type = BucketType::Old;
        ka.buckets.clear();

        let old_idx = self.calc_old_bucket(addr);
        if self.add_to_old_bucket(ka.clone(), old_idx) {
            return;
        }

        // No room, demote the bucket's oldest entry back to a new bucket.
        let oldest = match self.pick_oldest(BucketType::Old, old_idx) {
            Some(oldest) => oldest,
            None => return,
        };
        let mut demoted = match self.addr_lookup.get(&oldest) {
            Some(demoted) => demoted.clone(),
            None => return,
        };
        self.remove_from_bucket(&oldest, BucketType::Old, old_idx);

        demoted.bucket_type = BucketType::New;
        demoted.buckets.clear();

        let new_idx = self.calc_new_bucket(&demoted.addr, &demoted.src);
        let new_idx = if self.buckets_new[new_idx].len() < NEW_BUCKET_SIZE {
            new_idx
        } else {
            freed_bucket
        };
        debug!(addr = %demoted.addr, "demoting vetted address to make room");
        self.add_to_new_bucket(demoted, new_idx);

        let _res = self.add_to_old_bucket(ka, old_idx);
        debug_assert!(_res);
    }

    fn calc_new_bucket(&self, addr: &NetAddress, src: &NetAddress) -> usize {
        let src_group = src.group_key(self.routability_strict);

        let mut data1 = Vec::new();
        data1.extend_from_slice(self.key.as_bytes());
        data1.extend_from_slice(addr.group_key(self.routability_strict).as_bytes());
        data1.extend_from_slice(src_group.as_bytes());
        let hash64 = double_sha256_u64(&data1) % NEW_BUCKETS_PER_GROUP;

        let mut data2 = Vec::new();
        data2.extend_from_slice(self.key.as_bytes());
        data2.extend_from_slice(src_group.as_bytes());
        data2.extend_from_slice(&hash64.to_be_bytes());

        (double_sha256_u64(&data2) % NEW_BUCKET_COUNT as u64) as usize
    }

    fn calc_old_bucket(&self, addr: &NetAddress) -> usize {
        let mut data1 = Vec::new();
        data1.extend_from_slice(self.key.as_bytes());
        data1.extend_from_slice(addr.to_string().as_bytes());
        let hash64 = double_sha256_u64(&data1) % OLD_BUCKETS_PER_GROUP;

        let mut data2 = Vec::new();
        data2.extend_from_slice(self.key.as_bytes());
        data2.extend_from_slice(addr.group_key(self.routability_strict).as_bytes());
        data2.extend_from_slice(&hash64.to_be_bytes());

        (double_sha256_u64(&data2) % OLD_BUCKET_COUNT as u64) as usize
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let mut n_new = 0;
        let mut n_old = 0;

        for (addr, ka) in &self.addr_lookup {
            assert!(!ka.buckets.is_empty());
            let buckets = match ka.bucket_type {
                BucketType::New => {
                    n_new += 1;
                    &self.buckets_new
                }
                BucketType::Old => {
                    n_old += 1;
                    assert_eq!(ka.buckets.len(), 1);
                    &self.buckets_old
                }
            };

            for &idx in &ka.buckets {
                assert!(buckets[idx].contains(addr));
            }
        }

        let refs: usize = self
            .buckets_new
            .iter()
            .chain(self.buckets_old.iter())
            .map(Vec::len)
            .sum();
        let expected: usize = self.addr_lookup.values().map(|ka| ka.buckets.len()).sum();

        assert_eq!(refs, expected);
        assert_eq!(self.n_new, n_new);
        assert_eq!(self.n_old, n_old);
    }
}

fn double_sha256_u64(data: &[u8]) -> u64 {
    let hash = Sha256::digest(Sha256::digest(data));

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(bytes)
}
