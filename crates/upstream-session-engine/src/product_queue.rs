// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Product queue reader.
//!
//! The production backend is a SQLite database opened in WAL (write-ahead
//! log) journal mode -- the mode under which SQLite natively supports one
//! writer and many lock-free concurrent readers, which is exactly the
//! concurrency model the queue needs: the (out-of-scope) ingest/multicast
//! sender process appends rows while this session-local reader walks them
//! by cursor. The engine's connection is opened read-only and never issues
//! a write statement.

use crate::protocol::{FeedMask, Signature};
use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

/// A product as read from the queue, ready to hand to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub signature: Signature,
    pub feed: FeedMask,
    pub seq: u64,
    pub timestamp_unix: i64,
    pub origin: String,
    pub payload: Vec<u8>,
}

/// A feed-mask filter, built by narrowing a "match-all" template to a
/// session's feed -- semantically just "feed-mask intersects session feed".
#[derive(Debug, Clone, Copy)]
pub struct ProductClass {
    feed_mask: FeedMask,
}

impl ProductClass {
    pub const fn match_all() -> Self {
        Self { feed_mask: u32::MAX }
    }

    pub const fn narrowed_to(feed: FeedMask) -> Self {
        Self { feed_mask: feed }
    }

    pub fn matches(&self, feed: FeedMask) -> bool {
        feed & self.feed_mask != 0
    }
}

/// Outcome of positioning the cursor from a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorResult {
    Ok,
    NotFound,
}

/// Errors from the product queue.
#[derive(Debug)]
pub enum ProductQueueError {
    NotFound,
    Backend(String),
}

impl std::fmt::Display for ProductQueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "product not found"),
            Self::Backend(s) => write!(f, "product queue error: {}", s),
        }
    }
}

impl std::error::Error for ProductQueueError {}

/// Abstraction over the product queue, consumed by the missed-product
/// stream and the backlog stream.
pub trait ProductQueue: Send {
    /// Positions the cursor just past the product with signature `sig`.
    fn set_cursor_from_signature(&mut self, sig: Signature) -> Result<CursorResult, ProductQueueError>;

    /// Positions the cursor at the first product at or after `timestamp_unix`.
    fn set_cursor_from_time(&mut self, timestamp_unix: i64) -> Result<(), ProductQueueError>;

    /// Returns the next product at or after the cursor matching `class`,
    /// advancing the cursor past it. `Ok(None)` means end-of-queue.
    fn next_matching(&mut self, class: &ProductClass) -> Result<Option<Product>, ProductQueueError>;

    /// Looks up a product directly by signature, independent of the cursor.
    fn get_by_signature(&self, sig: Signature) -> Result<Option<Product>, ProductQueueError>;
}

/// Production, SQLite-backed, read-only product queue.
pub struct SqliteProductQueue {
    conn: Connection,
    cursor_rowid: i64,
}

impl SqliteProductQueue {
    /// Opens the queue file read-only. The schema is created and
    /// maintained by the out-of-scope ingest/multicast-sender process;
    /// this reader never issues DDL or DML.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("opening product queue at {}", path.display()))?;
        conn.pragma_update(None, "query_only", true)
            .context("setting query_only pragma")?;
        Ok(Self {
            conn,
            cursor_rowid: 0,
        })
    }

    fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
        let sig_blob: Vec<u8> = row.get("signature")?;
        let mut signature = [0u8; 16];
        if sig_blob.len() == 16 {
            signature.copy_from_slice(&sig_blob);
        }
        Ok(Product {
            signature,
            feed: row.get("feed")?,
            seq: row.get("seq")?,
            timestamp_unix: row.get("ts_unix")?,
            origin: row.get("origin")?,
            payload: row.get("payload")?,
        })
    }
}

impl ProductQueue for SqliteProductQueue {
    fn set_cursor_from_signature(&mut self, sig: Signature) -> Result<CursorResult, ProductQueueError> {
        let (result, cursor) = cursor_from_signature(&self.conn, sig)?;
        self.cursor_rowid = cursor;
        Ok(result)
    }

    fn set_cursor_from_time(&mut self, timestamp_unix: i64) -> Result<(), ProductQueueError> {
        self.cursor_rowid = cursor_from_time(&self.conn, timestamp_unix)?;
        Ok(())
    }

    fn next_matching(&mut self, class: &ProductClass) -> Result<Option<Product>, ProductQueueError> {
        let (product, cursor) = next_matching(&self.conn, self.cursor_rowid, class)?;
        self.cursor_rowid = cursor;
        Ok(product)
    }

    fn get_by_signature(&self, sig: Signature) -> Result<Option<Product>, ProductQueueError> {
        lookup_by_signature(&self.conn, sig)
    }
}

use rusqlite::OptionalExtension;

/// Positions a cursor from a signature lookup. Shared between the
/// production backend and the in-memory test backend below so both
/// implement identical cursor semantics.
fn cursor_from_signature(
    conn: &Connection,
    sig: Signature,
) -> Result<(CursorResult, i64), ProductQueueError> {
    let rowid: Option<i64> = conn
        .query_row(
            "SELECT rowid FROM products WHERE signature = ?1",
            [sig.to_vec()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| ProductQueueError::Backend(e.to_string()))?;

    match rowid {
        Some(r) => Ok((CursorResult::Ok, r)),
        None => Ok((CursorResult::NotFound, 0)),
    }
}

fn cursor_from_time(conn: &Connection, timestamp_unix: i64) -> Result<i64, ProductQueueError> {
    let first: Option<i64> = conn
        .query_row(
            "SELECT MIN(rowid) FROM products WHERE ts_unix >= ?1",
            [timestamp_unix],
            |row| row.get(0),
        )
        .map_err(|e| ProductQueueError::Backend(e.to_string()))?;

    Ok(match first {
        Some(r) => r - 1,
        None => i64::MAX,
    })
}

fn next_matching(
    conn: &Connection,
    cursor_rowid: i64,
    class: &ProductClass,
) -> Result<(Option<Product>, i64), ProductQueueError> {
    if cursor_rowid == i64::MAX {
        return Ok((None, cursor_rowid));
    }
    let mut cursor = cursor_rowid;
    loop {
        let mut stmt = conn
            .prepare_cached(
                "SELECT rowid, signature, feed, seq, ts_unix, origin, payload \
                 FROM products WHERE rowid > ?1 ORDER BY rowid ASC LIMIT 1",
            )
            .map_err(|e| ProductQueueError::Backend(e.to_string()))?;

        let row: Option<(i64, Product)> = stmt
            .query_row([cursor], |row| {
                let rowid: i64 = row.get(0)?;
                Ok((rowid, SqliteProductQueue::row_to_product(row)?))
            })
            .optional()
            .map_err(|e| ProductQueueError::Backend(e.to_string()))?;

        match row {
            None => return Ok((None, cursor)),
            Some((rowid, product)) => {
                cursor = rowid;
                if class.matches(product.feed) {
                    return Ok((Some(product), cursor));
                }
                // Not a match: skip past it and keep scanning.
            }
        }
    }
}

fn lookup_by_signature(conn: &Connection, sig: Signature) -> Result<Option<Product>, ProductQueueError> {
    conn.query_row(
        "SELECT rowid, signature, feed, seq, ts_unix, origin, payload \
         FROM products WHERE signature = ?1",
        [sig.to_vec()],
        SqliteProductQueue::row_to_product,
    )
    .optional()
    .map_err(|e| ProductQueueError::Backend(e.to_string()))
}

/// Test-only schema creation and insertion helpers, and an in-memory fake
/// backend for use where a real SQLite file would be overkill.
#[cfg(test)]
pub mod fixtures {
    use super::*;

    pub fn create_schema(conn: &Connection) {
        conn.execute(
            "CREATE TABLE products (
                signature BLOB NOT NULL UNIQUE,
                feed INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                ts_unix INTEGER NOT NULL,
                origin TEXT NOT NULL,
                payload BLOB NOT NULL
            )",
            [],
        )
        .unwrap();
    }

    pub fn insert_product(conn: &Connection, p: &Product) {
        conn.execute(
            "INSERT INTO products (signature, feed, seq, ts_unix, origin, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                p.signature.to_vec(),
                p.feed,
                p.seq,
                p.timestamp_unix,
                p.origin,
                p.payload,
            ],
        )
        .unwrap();
    }

    /// A writable, in-memory SQLite-backed queue for tests (the production
    /// reader is always read-only against a file written by another
    /// process, but tests need to seed data themselves).
    pub struct TestProductQueue {
        conn: Connection,
        cursor_rowid: i64,
    }

    impl TestProductQueue {
        pub fn new() -> Self {
            let conn = Connection::open_in_memory().unwrap();
            create_schema(&conn);
            Self {
                conn,
                cursor_rowid: 0,
            }
        }

        pub fn seed(&self, p: &Product) {
            insert_product(&self.conn, p);
        }
    }

    impl ProductQueue for TestProductQueue {
        fn set_cursor_from_signature(&mut self, sig: Signature) -> Result<CursorResult, ProductQueueError> {
            let (result, cursor) = cursor_from_signature(&self.conn, sig)?;
            self.cursor_rowid = cursor;
            Ok(result)
        }

        fn set_cursor_from_time(&mut self, timestamp_unix: i64) -> Result<(), ProductQueueError> {
            self.cursor_rowid = cursor_from_time(&self.conn, timestamp_unix)?;
            Ok(())
        }

        fn next_matching(&mut self, class: &ProductClass) -> Result<Option<Product>, ProductQueueError> {
            let (product, cursor) = next_matching(&self.conn, self.cursor_rowid, class)?;
            self.cursor_rowid = cursor;
            Ok(product)
        }

        fn get_by_signature(&self, sig: Signature) -> Result<Option<Product>, ProductQueueError> {
            lookup_by_signature(&self.conn, sig)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::TestProductQueue;
    use super::*;

    fn sig(b: u8) -> Signature {
        [b; 16]
    }

    fn product(sig_byte: u8, feed: FeedMask, seq: u64, ts: i64) -> Product {
        Product {
            signature: sig(sig_byte),
            feed,
            seq,
            timestamp_unix: ts,
            origin: "origin-a".into(),
            payload: vec![sig_byte; 4],
        }
    }

    #[test]
    fn product_class_matches_intersecting_feeds_only() {
        let class = ProductClass::narrowed_to(0b0110);
        assert!(class.matches(0b0010));
        assert!(class.matches(0b0100));
        assert!(!class.matches(0b1000));
        assert!(ProductClass::match_all().matches(0b1000));
    }

    #[test]
    fn next_matching_walks_in_rowid_order_and_skips_non_matching_feeds() {
        let q = TestProductQueue::new();
        q.seed(&product(1, 0x01, 1, 100));
        q.seed(&product(2, 0x02, 2, 101));
        q.seed(&product(3, 0x01, 3, 102));

        let mut q = q;
        let class = ProductClass::narrowed_to(0x01);
        let first = q.next_matching(&class).unwrap().unwrap();
        assert_eq!(first.signature, sig(1));
        let second = q.next_matching(&class).unwrap().unwrap();
        assert_eq!(second.signature, sig(3));
        assert!(q.next_matching(&class).unwrap().is_none());
    }

    #[test]
    fn set_cursor_from_signature_then_next_matching_resumes_after_it() {
        let q = TestProductQueue::new();
        q.seed(&product(1, 0x01, 1, 100));
        q.seed(&product(2, 0x01, 2, 101));
        q.seed(&product(3, 0x01, 3, 102));

        let mut q = q;
        let result = q.set_cursor_from_signature(sig(2)).unwrap();
        assert_eq!(result, CursorResult::Ok);

        let next = q.next_matching(&ProductClass::match_all()).unwrap().unwrap();
        assert_eq!(next.signature, sig(3));
    }

    #[test]
    fn set_cursor_from_signature_reports_not_found() {
        let q = TestProductQueue::new();
        q.seed(&product(1, 0x01, 1, 100));

        let mut q = q;
        let result = q.set_cursor_from_signature(sig(99)).unwrap();
        assert_eq!(result, CursorResult::NotFound);
    }

    #[test]
    fn set_cursor_from_time_positions_before_first_matching_timestamp() {
        let q = TestProductQueue::new();
        q.seed(&product(1, 0x01, 1, 100));
        q.seed(&product(2, 0x01, 2, 200));
        q.seed(&product(3, 0x01, 3, 300));

        let mut q = q;
        q.set_cursor_from_time(150).unwrap();
        let next = q.next_matching(&ProductClass::match_all()).unwrap().unwrap();
        assert_eq!(next.signature, sig(2));
    }

    #[test]
    fn set_cursor_from_time_past_all_products_yields_end_of_queue() {
        let q = TestProductQueue::new();
        q.seed(&product(1, 0x01, 1, 100));

        let mut q = q;
        q.set_cursor_from_time(9_999).unwrap();
        assert!(q.next_matching(&ProductClass::match_all()).unwrap().is_none());
    }

    #[test]
    fn get_by_signature_is_independent_of_cursor() {
        let q = TestProductQueue::new();
        q.seed(&product(1, 0x01, 1, 100));
        q.seed(&product(2, 0x01, 2, 200));

        let found = q.get_by_signature(sig(2)).unwrap().unwrap();
        assert_eq!(found.seq, 2);
        assert!(q.get_by_signature(sig(42)).unwrap().is_none());
    }
}
