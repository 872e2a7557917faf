//! Segment file lifecycle management.
//!
//! A store directory holds `segment-<N>` files for a monotonically
//! increasing integer N. Exactly one segment, the one with the largest N,
//! is active and appended to; every other segment is sealed and read-only.
//! Sealed segments are destroyed only by compaction, which replaces them
//! with a merged file published through a `segment-<N>.merged.tmp` →
//! rename swap.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{Error, Result};

const SEGMENT_PREFIX: &str = "segment-";

/// Generate a segment filename from an id (e.g. `segment-42`).
pub fn segment_filename(id: u64) -> String {
    format!("{SEGMENT_PREFIX}{id}")
}

/// Path to a segment file.
pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(segment_filename(id))
}

/// Path to the temp file a merge is staged in before the atomic swap.
pub fn merged_temp_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{id}.merged.tmp"))
}

/// Parse a segment filename back into its id.
///
/// Returns `None` for anything that is not exactly `segment-<digits>`,
/// including merge temp files.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    let id = name.strip_prefix(SEGMENT_PREFIX)?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    id.parse::<u64>().ok()
}

/// Discover all segment ids in a directory, sorted ascending.
pub fn discover_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(id) = parse_segment_filename(name) {
            segments.push(id);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// Delete `*.tmp` and `*.merged` leftovers from an interrupted merge.
pub fn remove_stale_files(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.ends_with(".tmp") || name.ends_with(".merged") {
            warn!("removing stale merge file {}", path.display());
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Owns the read handles for all sealed segments plus the single active
/// append handle. All mutation happens under the store's write lock.
pub(crate) struct SegmentSet {
    dir: PathBuf,
    readers: BTreeMap<u64, File>,
    active: File,
    active_id: u64,
}

impl SegmentSet {
    /// Open a store directory.
    ///
    /// Creates the directory if missing, removes merge leftovers, opens
    /// every existing segment read-only, and creates a fresh active segment
    /// with id `max_seen + 1` (or 0 for an empty directory).
    pub fn open(dir: impl Into<PathBuf>) -> Result<SegmentSet> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        remove_stale_files(&dir)?;

        let mut readers = BTreeMap::new();
        let ids = discover_segments(&dir)?;
        for id in &ids {
            let file = File::open(segment_path(&dir, *id))?;
            readers.insert(*id, file);
        }

        let active_id = ids.last().map_or(0, |id| id + 1);
        let active = open_active(&dir, active_id)?;

        Ok(SegmentSet {
            dir,
            readers,
            active,
            active_id,
        })
    }

    pub fn active_id(&self) -> u64 {
        self.active_id
    }

    /// Ids of all sealed segments, ascending.
    pub fn sealed_ids(&self) -> Vec<u64> {
        self.readers.keys().copied().collect()
    }

    /// Byte size of the active segment.
    pub fn size_of_active(&self) -> Result<u64> {
        Ok(self.active.metadata()?.len())
    }

    /// Seal the active segment and start a fresh one with the next id.
    ///
    /// The sealed file is synced before the writable handle is dropped,
    /// then reopened read-only into the reader map.
    pub fn rotate(&mut self) -> Result<()> {
        let next_id = self.active_id + 1;
        let next = open_active(&self.dir, next_id)?;

        let sealed = std::mem::replace(&mut self.active, next);
        sealed.sync_all()?;
        drop(sealed);

        let reader = File::open(segment_path(&self.dir, self.active_id))?;
        self.readers.insert(self.active_id, reader);
        self.active_id = next_id;
        Ok(())
    }

    /// Append encoded record bytes to the active segment.
    ///
    /// Returns the offset the record starts at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        use std::io::Write;
        let offset = self.size_of_active()?;
        self.active.write_all(bytes)?;
        Ok(offset)
    }

    /// Positional read of `size` bytes at `offset` in the given segment.
    ///
    /// Uses `pread`, so concurrent readers never disturb each other's
    /// file positions.
    pub fn read_record_at(&self, segment_id: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let handle = if segment_id == self.active_id {
            &self.active
        } else {
            self.readers
                .get(&segment_id)
                .ok_or(Error::Corrupt("index points at a missing segment"))?
        };
        let mut buf = vec![0u8; size as usize];
        handle.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Read handle for a sealed segment.
    pub fn sealed_handle(&self, segment_id: u64) -> Option<&File> {
        self.readers.get(&segment_id)
    }

    /// Swap the freshly published merge in for the target id's stale
    /// handle.
    pub fn adopt_merged(&mut self, target: u64) -> Result<()> {
        let file = File::open(segment_path(&self.dir, target))?;
        self.readers.insert(target, file);
        Ok(())
    }

    /// Unlink a merged-away sealed segment, then drop its read handle.
    ///
    /// The handle is kept until the unlink succeeds, so a failed cleanup
    /// leaves the segment readable.
    pub fn retire_sealed(&mut self, id: u64) -> Result<()> {
        std::fs::remove_file(segment_path(&self.dir, id))?;
        self.readers.remove(&id);
        Ok(())
    }

    /// Drop all sealed read handles and sync the active segment.
    pub fn close(&mut self) {
        if let Err(err) = self.active.sync_all() {
            warn!("failed to sync active segment on close: {err}");
        }
        self.readers.clear();
    }
}

fn open_active(dir: &Path, id: u64) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(segment_path(dir, id))?;
    Ok(file)
}
