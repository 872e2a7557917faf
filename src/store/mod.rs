//! Append-only segmented key-value store.
//!
//! Layout on disk: a directory of `segment-<N>` files, each a plain
//! concatenation of records. Reads go straight to a segment file at the
//! offset the in-memory index records for the key; writes funnel through a
//! single writer thread. A background compactor periodically folds sealed
//! segments into one.
//!
//! Scheduling model: parallel readers, one serialized writer. The store
//! carries a single reader-writer lock; readers hold it shared for the
//! duration of a positional read, the writer and the compactor take it
//! exclusively.

pub mod compact;
pub mod index;
pub mod record;
pub mod segment;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

pub use compact::Compactor;
pub use record::{DataType, Value};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use index::Index;
use segment::SegmentSet;
use writer::WriteRequest;

/// Segment set and index, guarded together by the store lock.
pub(crate) struct StoreInner {
    pub segments: SegmentSet,
    pub index: Index,
}

pub struct KvStore {
    dir: PathBuf,
    inner: Arc<RwLock<StoreInner>>,
    requests: Mutex<Option<Sender<WriteRequest>>>,
    writer_thread: Mutex<Option<JoinHandle<()>>>,
    merge_gate: compact::MergeGate,
    closed: AtomicBool,
}

impl KvStore {
    /// Open a store directory and start the writer thread.
    ///
    /// Rebuilds the index by scanning every existing segment in ascending
    /// id order; corruption found during the scan fails the open.
    pub fn open(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Arc<KvStore>> {
        let dir = dir.as_ref().to_path_buf();
        let segments = SegmentSet::open(&dir)?;
        let index = Index::rebuild(&segments)?;
        log::info!(
            "opened store at {} ({} keys, active segment {})",
            dir.display(),
            index.len(),
            segments.active_id()
        );

        let inner = Arc::new(RwLock::new(StoreInner { segments, index }));
        let (tx, rx) = mpsc::channel();
        let writer_inner = Arc::clone(&inner);
        let writer_thread = std::thread::spawn(move || writer::run(writer_inner, config, rx));

        Ok(Arc::new(KvStore {
            dir,
            inner,
            requests: Mutex::new(Some(tx)),
            writer_thread: Mutex::new(Some(writer_thread)),
            merge_gate: compact::MergeGate::default(),
            closed: AtomicBool::new(false),
        }))
    }

    /// Store a string value.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.submit(key, Value::Str(value.as_bytes().to_vec()))
    }

    /// Store a 64-bit integer value.
    pub fn put_int64(&self, key: &str, value: i64) -> Result<()> {
        self.submit(key, Value::Int64(value))
    }

    /// Fetch a string value.
    pub fn get(&self, key: &str) -> Result<String> {
        match self.lookup(key.as_bytes(), DataType::Str)? {
            Value::Str(bytes) => {
                String::from_utf8(bytes).map_err(|_| Error::Corrupt("value is not valid utf-8"))
            }
            Value::Int64(_) => Err(Error::Corrupt("index type does not match record")),
        }
    }

    /// Fetch a 64-bit integer value.
    pub fn get_int64(&self, key: &str) -> Result<i64> {
        match self.lookup(key.as_bytes(), DataType::Int64)? {
            Value::Int64(v) => Ok(v),
            Value::Str(_) => Err(Error::Corrupt("index type does not match record")),
        }
    }

    /// Fold all sealed segments into one, keeping the latest record per key.
    ///
    /// Returns `false` when nothing was compacted: fewer than two sealed
    /// segments, another compaction already in flight, or the store closed.
    pub fn compact(&self) -> Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        if !self.merge_gate.try_acquire() {
            return Ok(false);
        }
        let result = (|| {
            let mut guard = self
                .inner
                .write()
                .map_err(|_| Error::Corrupt("store lock poisoned"))?;
            compact::merge_sealed(&mut guard, &self.dir)
        })();
        self.merge_gate.release();
        result
    }

    /// Shut the store down: stop accepting writes, wait for the writer
    /// thread to drain, then close the segment handles.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.requests
            .lock()
            .map_err(|_| Error::Corrupt("store lock poisoned"))?
            .take();
        let thread = self
            .writer_thread
            .lock()
            .map_err(|_| Error::Corrupt("store lock poisoned"))?
            .take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
        let mut guard = self
            .inner
            .write()
            .map_err(|_| Error::Corrupt("store lock poisoned"))?;
        guard.segments.close();
        Ok(())
    }

    fn submit(&self, key: &str, value: Value) -> Result<()> {
        let tx = {
            let guard = self
                .requests
                .lock()
                .map_err(|_| Error::Corrupt("store lock poisoned"))?;
            guard.as_ref().ok_or(Error::Closed)?.clone()
        };
        let (reply, receipt) = mpsc::sync_channel(1);
        tx.send(WriteRequest {
            key: key.as_bytes().to_vec(),
            value,
            reply,
        })
        .map_err(|_| Error::Closed)?;
        receipt.recv().map_err(|_| Error::Closed)?
    }

    fn lookup(&self, key: &[u8], expected: DataType) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let guard = self
            .inner
            .read()
            .map_err(|_| Error::Corrupt("store lock poisoned"))?;
        let entry = *guard.index.get(key).ok_or(Error::NotFound)?;
        if entry.data_type != expected {
            return Err(Error::WrongType);
        }
        let bytes = guard
            .segments
            .read_record_at(entry.segment_id, entry.offset, entry.size)?;
        drop(guard);

        let record = record::decode(&bytes)?;
        if record.key != key {
            return Err(Error::Corrupt("index points at a record for another key"));
        }
        Ok(record.value)
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tiny_config(max_segment_bytes: u64) -> StoreConfig {
        StoreConfig {
            max_segment_bytes,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path(), StoreConfig::default()).unwrap();

        store.put("greeting", "hello").unwrap();
        store.put_int64("answer", 42).unwrap();

        assert_eq!(store.get("greeting").unwrap(), "hello");
        assert_eq!(store.get_int64("answer").unwrap(), 42);
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert!(matches!(store.get("missing"), Err(Error::NotFound)));
        assert!(matches!(store.get_int64("missing"), Err(Error::NotFound)));
    }

    #[test]
    fn test_type_mismatch_is_wrong_type() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path(), StoreConfig::default()).unwrap();

        store.put("text", "abc").unwrap();
        store.put_int64("number", 7).unwrap();

        assert!(matches!(store.get_int64("text"), Err(Error::WrongType)));
        assert!(matches!(store.get("number"), Err(Error::WrongType)));
    }

    #[test]
    fn test_latest_write_wins() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path(), StoreConfig::default()).unwrap();

        for n in 0..10 {
            store.put("counter", &format!("value-{n}")).unwrap();
        }
        assert_eq!(store.get("counter").unwrap(), "value-9");
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path(), StoreConfig::default()).unwrap();
        store.put("k", "v").unwrap();
        store.close().unwrap();

        assert!(matches!(store.put("k", "again"), Err(Error::Closed)));
        assert!(matches!(store.get("k"), Err(Error::Closed)));
    }

    #[test]
    fn test_rotation_lands_write_in_new_segment() {
        let dir = TempDir::new().unwrap();
        // Each record below is 29 bytes; cap at two records per segment.
        let store = KvStore::open(dir.path(), tiny_config(58)).unwrap();

        store.put("key-000", "value-000").unwrap();
        store.put("key-001", "value-001").unwrap();
        store.put("key-002", "value-002").unwrap();

        assert!(segment::segment_path(dir.path(), 1).exists());
        assert_eq!(store.get("key-000").unwrap(), "value-000");
        assert_eq!(store.get("key-002").unwrap(), "value-002");
    }
}
