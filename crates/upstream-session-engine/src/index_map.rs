// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Product-index map reader.
//!
//! A feed-scoped, on-disk dictionary from multicast sequence index to
//! product signature, written by the (out-of-scope) multicast sender and
//! read here. Records are fixed-size and append-only, sorted ascending by
//! sequence index:
//!
//! ```text
//! +----------------------+-------------------+
//! | seq index (8B BE)    | signature (16B)   |
//! +----------------------+-------------------+
//! ```
//!
//! Because the writer only ever appends and never rewrites earlier
//! records, a reader may safely memory-map a prefix of a file that is
//! still being extended by another process and binary-search it.

use crate::protocol::{FeedMask, Signature};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

const RECORD_LEN: usize = 8 + 16;

/// Errors opening or reading an index map.
#[derive(Debug)]
pub enum IndexMapError {
    Io(String),
    Corrupt(String),
}

impl std::fmt::Display for IndexMapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Corrupt(s) => write!(f, "corrupt index map: {}", s),
        }
    }
}

impl std::error::Error for IndexMapError {}

/// Abstraction over the product-index map, consumed by the missed-product
/// stream. A successful `open_for_reading` must be matched by exactly
/// one `close` on every exit path; this implementation expresses that as
/// `Drop` rather than an explicit termination hook.
pub trait ProductIndexMap: Send {
    fn get(&self, index: u64) -> Option<Signature>;
}

/// Memory-mapped, read-only index map for one feed. `None` when the file
/// exists but is empty -- `memmap2` refuses to map a zero-length file, and
/// a brand-new feed with no records yet appended is exactly that case.
pub struct MmapIndexMap {
    mmap: Option<Mmap>,
}

impl MmapIndexMap {
    /// Opens the index file for `feed` under `directory`. The file is
    /// named by the feed's canonical hex mask, e.g. `directory/0000000f.idx`.
    pub fn open_for_reading(directory: &Path, feed: FeedMask) -> Result<Self, IndexMapError> {
        let path = index_file_path(directory, feed);
        let file = File::open(&path).map_err(|e| {
            IndexMapError::Io(format!("opening index map {}: {}", path.display(), e))
        })?;

        let len = file
            .metadata()
            .map_err(|e| IndexMapError::Io(format!("stat of {}: {}", path.display(), e)))?
            .len() as usize;

        if len == 0 {
            return Ok(Self { mmap: None });
        }

        // SAFETY: the mapped file is only ever appended to by the sibling
        // writer process and never truncated or rewritten in place for
        // already-written records, so reads through this mapping observe
        // either an old or a new consistent prefix, never a torn record.
        let mmap = unsafe {
            Mmap::map(&file)
                .map_err(|e| IndexMapError::Io(format!("mmap of {}: {}", path.display(), e)))?
        };

        if mmap.len() % RECORD_LEN != 0 {
            return Err(IndexMapError::Corrupt(format!(
                "index map {} has a partial trailing record ({} bytes)",
                path.display(),
                mmap.len()
            )));
        }

        Ok(Self { mmap: Some(mmap) })
    }

    fn record_count(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len() / RECORD_LEN)
    }

    fn record_index(&self, i: usize) -> u64 {
        let mmap = self.mmap.as_ref().expect("record_index called with no records");
        let off = i * RECORD_LEN;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&mmap[off..off + 8]);
        u64::from_be_bytes(buf)
    }

    fn record_signature(&self, i: usize) -> Signature {
        let mmap = self.mmap.as_ref().expect("record_signature called with no records");
        let off = i * RECORD_LEN + 8;
        let mut sig = [0u8; 16];
        sig.copy_from_slice(&mmap[off..off + 16]);
        sig
    }
}

impl ProductIndexMap for MmapIndexMap {
    fn get(&self, index: u64) -> Option<Signature> {
        let n = self.record_count();
        if n == 0 {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let mid_index = self.record_index(mid);
            match mid_index.cmp(&index) {
                std::cmp::Ordering::Equal => return Some(self.record_signature(mid)),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        None
    }
}

fn index_file_path(directory: &Path, feed: FeedMask) -> PathBuf {
    directory.join(format!("{:08x}.idx", feed))
}

/// Writes a well-formed index file for tests and fixtures: `records` must
/// already be sorted ascending by index.
#[cfg(test)]
pub fn write_index_file(
    directory: &Path,
    feed: FeedMask,
    records: &[(u64, Signature)],
) -> std::io::Result<()> {
    use std::io::Write;
    let path = index_file_path(directory, feed);
    let mut buf = Vec::with_capacity(records.len() * RECORD_LEN);
    for (index, sig) in records {
        buf.extend_from_slice(&index.to_be_bytes());
        buf.extend_from_slice(sig);
    }
    let mut file = File::create(path)?;
    file.write_all(&buf)?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sig(b: u8) -> Signature {
        [b; 16]
    }

    #[test]
    fn lookup_hit_and_miss() {
        let dir = tempdir().unwrap();
        write_index_file(dir.path(), 0x0F, &[(10, sig(1)), (20, sig(2)), (30, sig(3))]).unwrap();

        let map = MmapIndexMap::open_for_reading(dir.path(), 0x0F).unwrap();
        assert_eq!(map.get(20), Some(sig(2)));
        assert_eq!(map.get(10), Some(sig(1)));
        assert_eq!(map.get(30), Some(sig(3)));
        assert_eq!(map.get(25), None);
        assert_eq!(map.get(999), None);
    }

    #[test]
    fn empty_index_map_misses_everything() {
        let dir = tempdir().unwrap();
        write_index_file(dir.path(), 0x01, &[]).unwrap();
        let map = MmapIndexMap::open_for_reading(dir.path(), 0x01).unwrap();
        assert_eq!(map.get(0), None);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let result = MmapIndexMap::open_for_reading(dir.path(), 0xAB);
        assert!(result.is_err());
    }
}
