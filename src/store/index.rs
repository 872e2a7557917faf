//! In-memory key index.
//!
//! Maps each live key to the physical location of its most recent record.
//! Nothing is persisted; the index is rebuilt on open by scanning every
//! segment in ascending id order and letting later records override
//! earlier ones.

use std::collections::HashMap;
use std::io::BufReader;

use crate::error::Result;
use crate::store::record::{self, DataType};
use crate::store::segment::SegmentSet;

/// Physical location of the latest record for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub segment_id: u64,
    pub offset: u64,
    pub size: u32,
    pub data_type: DataType,
}

#[derive(Debug, Default)]
pub(crate) struct Index {
    map: HashMap<Vec<u8>, IndexEntry>,
}

impl Index {
    pub fn get(&self, key: &[u8]) -> Option<&IndexEntry> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut IndexEntry> {
        self.map.get_mut(key)
    }

    pub fn insert(&mut self, key: Vec<u8>, entry: IndexEntry) {
        self.map.insert(key, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &IndexEntry)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Rebuild the index from the sealed segments of a freshly opened set.
    ///
    /// Any decode failure is fatal to the caller; a store with a corrupt
    /// segment does not open.
    pub fn rebuild(segments: &SegmentSet) -> Result<Index> {
        let mut index = Index::default();
        for id in segments.sealed_ids() {
            let file = segments
                .sealed_handle(id)
                .expect("sealed id from the same set");
            let mut reader = BufReader::new(file);
            let mut offset = 0u64;
            while let Some((record, consumed)) = record::decode_from(&mut reader)? {
                index.insert(
                    record.key,
                    IndexEntry {
                        segment_id: id,
                        offset,
                        size: consumed as u32,
                        data_type: record.value.data_type(),
                    },
                );
                offset += consumed;
            }
        }
        Ok(index)
    }
}
