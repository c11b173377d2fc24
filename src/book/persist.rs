use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use tracing::*;

use super::{AddrBook, BucketType, KnownAddress, NEW_BUCKET_COUNT, OLD_BUCKET_COUNT};
use crate::error::AddrBookError;

/// The on-disk representation of the book.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddrBookJson {
    key: String,
    addrs: Vec<KnownAddress>,
}

impl AddrBook {
    /// Writes the book to `path`.
    ///
    /// The document is written to a sibling temporary file first and renamed over the target, a
    /// crash mid-write leaves the previous file intact.
    pub fn save_to_file(&self, path: &Path) -> Result<(), AddrBookError> {
        let json = AddrBookJson {
            key: self.key.clone(),
            addrs: self.list_of_known_addresses(),
        };
        let bytes = serde_json::to_vec_pretty(&json)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");

        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, path)?;

        debug!(path = %path.display(), size = self.size(), "saved address book");

        Ok(())
    }

    /// Replaces the book's contents with those stored at `path`.
    ///
    /// Returns `Ok(false)` if there is no file yet. The book is left untouched if the file can't
    /// be read or describes an inconsistent layout.
    pub fn load_from_file(&mut self, path: &Path) -> Result<bool, AddrBookError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let json: AddrBookJson = serde_json::from_slice(&bytes)?;

        let mut buckets_new = vec![Vec::new(); NEW_BUCKET_COUNT];
        let mut buckets_old = vec![Vec::new(); OLD_BUCKET_COUNT];
        let mut addr_lookup = std::collections::HashMap::with_capacity(json.addrs.len());
        let (mut n_new, mut n_old) = (0, 0);

        for ka in json.addrs {
            let (buckets, max_refs) = match ka.bucket_type {
                BucketType::New => (&mut buckets_new, super::MAX_NEW_BUCKETS_PER_ADDRESS),
                BucketType::Old => (&mut buckets_old, 1),
            };

            if ka.buckets.is_empty() || ka.buckets.len() > max_refs {
                return Err(AddrBookError::Corrupt(format!(
                    "{} is in {} buckets",
                    ka.addr,
                    ka.buckets.len()
                )));
            }

            for &idx in &ka.buckets {
                let bucket = buckets.get_mut(idx).ok_or_else(|| {
                    AddrBookError::Corrupt(format!("{} has bucket index {idx} out of range", ka.addr))
                })?;

                if bucket.contains(&ka.addr) {
                    return Err(AddrBookError::Corrupt(format!(
                        "{} appears twice in bucket {idx}",
                        ka.addr
                    )));
                }
                bucket.push(ka.addr.clone());
            }

            match ka.bucket_type {
                BucketType::New => n_new += 1,
                BucketType::Old => n_old += 1,
            }

            if let Some(dup) = addr_lookup.insert(ka.addr.clone(), ka) {
                return Err(AddrBookError::Corrupt(format!("{} listed twice", dup.addr)));
            }
        }

        self.key = json.key;
        self.buckets_new = buckets_new;
        self.buckets_old = buckets_old;
        self.addr_lookup = addr_lookup;
        self.n_new = n_new;
        self.n_old = n_old;

        info!(path = %path.display(), size = self.size(), "loaded address book");

        Ok(true)
    }
}
