use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::core::addr::NetAddress;

/// Number of days without an attempt after which a new address is considered stale.
pub const NUM_MISSING_DAYS: i64 = 30;
/// Attempts without a single success after which a new address is considered unreachable.
pub const NUM_RETRIES: u32 = 3;
/// Failures tolerated without a recent success.
pub const MAX_FAILURES: u32 = 10;
/// Days since the last success before an address with [`MAX_FAILURES`] is evicted.
pub const MIN_BAD_DAYS: i64 = 7;

/// Whether an address sits in the unverified or the vetted part of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum BucketType {
    New,
    Old,
}

impl From<BucketType> for u8 {
    fn from(bucket_type: BucketType) -> Self {
        match bucket_type {
            BucketType::New => 0x01,
            BucketType::Old => 0x02,
        }
    }
}

impl TryFrom<u8> for BucketType {
    type Error = String;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x01 => Ok(BucketType::New),
            0x02 => Ok(BucketType::Old),
            other => Err(format!("unknown bucket type {other:#04x}")),
        }
    }
}

/// An address tracked by the book, along with its reputation and bucket membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KnownAddress {
    pub addr: NetAddress,
    /// The address that told us about this one.
    pub src: NetAddress,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_attempt: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    pub bucket_type: BucketType,
    /// Indices of the buckets holding the address: up to four new buckets, or exactly one old one.
    pub buckets: Vec<usize>,
}

impl KnownAddress {
    pub(crate) fn new(addr: NetAddress, src: NetAddress) -> Self {
        Self {
            addr,
            src,
            attempts: 0,
            last_attempt: OffsetDateTime::now_utc(),
            last_success: None,
            bucket_type: BucketType::New,
            buckets: Vec::new(),
        }
    }

    pub fn is_new(&self) -> bool {
        self.bucket_type == BucketType::New
    }

    pub fn is_old(&self) -> bool {
        self.bucket_type == BucketType::Old
    }

    /// Returns `true` if the address is a candidate for eviction.
    pub fn is_bad(&self) -> bool {
        self.is_bad_at(OffsetDateTime::now_utc())
    }

    /// Evaluates [`is_bad`](Self::is_bad) against the supplied clock.
    ///
    /// Vetted addresses are never bad. A new address is bad if any of the following holds:
    ///
    /// 1. it was attempted in the last minute (don't hammer it),
    /// 2. it hasn't been attempted in [`NUM_MISSING_DAYS`],
    /// 3. it has never succeeded after [`NUM_RETRIES`] attempts,
    /// 4. it hasn't succeeded in [`MIN_BAD_DAYS`] and has failed [`MAX_FAILURES`] times.
    pub fn is_bad_at(&self, now: OffsetDateTime) -> bool {
        if self.is_old() {
            return false;
        }

        if self.last_attempt > now - Duration::minutes(1) && self.attempts != 0 {
            return true;
        }

        if self.last_attempt < now - Duration::days(NUM_MISSING_DAYS) {
            return true;
        }

        if self.last_success.is_none() && self.attempts >= NUM_RETRIES {
            return true;
        }

        let recently_succeeded = self
            .last_success
            .map_or(false, |t| t >= now - Duration::days(MIN_BAD_DAYS));

        !recently_succeeded && self.attempts >= MAX_FAILURES
    }

    pub(crate) fn mark_attempt(&mut self) {
        self.last_attempt = OffsetDateTime::now_utc();
        self.attempts += 1;
    }

    pub(crate) fn mark_good(&mut self) {
        let now = OffsetDateTime::now_utc();
        self.last_attempt = now;
        self.last_success = Some(now);
        self.attempts = 0;
    }

    /// Records membership of a bucket, returning the new reference count or `None` if the address
    /// was already there.
    pub(crate) fn add_bucket_ref(&mut self, bucket_idx: usize) -> Option<usize> {
        if self.buckets.contains(&bucket_idx) {
            return None;
        }

        self.buckets.push(bucket_idx);
        Some(self.buckets.len())
    }

    /// Drops membership of a bucket, returning the remaining reference count or `None` if the
    /// address wasn't there.
    pub(crate) fn remove_bucket_ref(&mut self, bucket_idx: usize) -> Option<usize> {
        let pos = self.buckets.iter().position(|&idx| idx == bucket_idx)?;
        self.buckets.remove(pos);

        Some(self.buckets.len())
    }
}
