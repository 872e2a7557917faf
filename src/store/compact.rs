//! Background merge of sealed segments.
//!
//! Compaction collapses every sealed segment into one, keeping only the
//! latest record per key. The merged file is staged as
//! `segment-<T>.merged.tmp`, fsync'd, and renamed over the lowest sealed
//! id, so a crash at any point leaves either the old segments or the
//! published merge on disk; `open` deletes any leftover temp file.
//!
//! The active segment is never touched.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::error::Result;
use crate::store::segment::{merged_temp_path, segment_path};
use crate::store::{KvStore, StoreInner};

/// Single-holder gate; a second concurrent trigger is a no-op.
#[derive(Default)]
pub(crate) struct MergeGate(AtomicBool);

impl MergeGate {
    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Merge all sealed segments into the lowest sealed id.
///
/// Runs with the store's write lock held. Returns `false` when there are
/// fewer than two sealed segments. An error before the swap removes the
/// temp file and leaves the index untouched; an error after it leaves
/// every live key readable through the handles that are still open, and a
/// later pass retries the cleanup.
pub(crate) fn merge_sealed(inner: &mut StoreInner, dir: &Path) -> Result<bool> {
    let sealed = inner.segments.sealed_ids();
    if sealed.len() < 2 {
        return Ok(false);
    }
    let target = sealed[0];
    let tmp_path = merged_temp_path(dir, target);

    let moved = match stage_merge(inner, &tmp_path) {
        Ok(moved) => moved,
        Err(err) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
    };

    let target_path = segment_path(dir, target);
    publish(&tmp_path, &target_path)?;

    // Splice the index before any handle teardown: once every key that
    // lived in a sealed segment points at the merged target, a failed
    // cleanup below cannot strand a live key.
    inner.segments.adopt_merged(target)?;
    for (key, offset) in moved {
        if let Some(entry) = inner.index.get_mut(&key) {
            entry.segment_id = target;
            entry.offset = offset;
        }
    }
    for id in sealed.iter().filter(|id| **id != target) {
        inner.segments.retire_sealed(*id)?;
    }

    debug!(
        "merged {} sealed segments into segment-{target}",
        sealed.len()
    );
    Ok(true)
}

/// Copy the latest record of every key living in a sealed segment into the
/// temp file, returning each key's new offset.
fn stage_merge(inner: &StoreInner, tmp_path: &Path) -> Result<Vec<(Vec<u8>, u64)>> {
    let mut tmp = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp_path)?;

    let active_id = inner.segments.active_id();
    let mut moved = Vec::new();
    let mut offset = 0u64;
    for (key, entry) in inner.index.iter() {
        if entry.segment_id == active_id {
            continue;
        }
        let bytes = inner
            .segments
            .read_record_at(entry.segment_id, entry.offset, entry.size)?;
        tmp.write_all(&bytes)?;
        moved.push((key.clone(), offset));
        offset += entry.size as u64;
    }

    tmp.sync_all()?;
    Ok(moved)
}

/// write-temp → fsync → remove old target → rename.
///
/// The staged temp is deleted on failure only while the old target still
/// exists. Once the target has been unlinked the temp is the sole copy of
/// the merged records, so a failed rename is retried and the temp is left
/// on disk rather than discarded.
fn publish(tmp_path: &Path, target_path: &Path) -> Result<()> {
    if let Err(err) = fs::remove_file(target_path) {
        let _ = fs::remove_file(tmp_path);
        return Err(err.into());
    }
    if let Err(err) = fs::rename(tmp_path, target_path) {
        warn!("retrying merged segment publish: {err}");
        if let Err(err) = fs::rename(tmp_path, target_path) {
            warn!(
                "merged segment left at {} after failed publish: {err}",
                tmp_path.display()
            );
            return Err(err.into());
        }
    }
    Ok(())
}

/// Periodic compaction driver.
///
/// Wakes every `interval`, triggers a merge, and stops promptly when
/// signalled.
pub struct Compactor {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Compactor {
    pub fn start(store: Arc<KvStore>, interval: Duration) -> Compactor {
        let (shutdown, ticks) = mpsc::channel();
        let thread = std::thread::spawn(move || loop {
            match ticks.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = store.compact() {
                        warn!("compaction failed: {err}");
                    }
                }
                _ => break,
            }
        });
        Compactor {
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        self.signal();
    }
}
