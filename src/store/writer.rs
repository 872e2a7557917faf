//! Single-consumer write path.
//!
//! All mutations funnel through one writer thread that owns the right to
//! touch the active segment and the index. Callers enqueue a request and
//! block on a single-use reply channel, so writes complete strictly in
//! submission order.

use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, RwLock};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::store::index::IndexEntry;
use crate::store::record::{self, Record, Value};
use crate::store::StoreInner;

pub(crate) struct WriteRequest {
    pub key: Vec<u8>,
    pub value: Value,
    pub reply: SyncSender<Result<()>>,
}

/// Drain the request queue until every sender is gone.
///
/// A failed append is reported on the request's reply channel and does not
/// stop the loop.
pub(crate) fn run(
    inner: Arc<RwLock<StoreInner>>,
    config: StoreConfig,
    requests: Receiver<WriteRequest>,
) {
    for request in requests {
        let result = apply(&inner, &config, request.key, request.value);
        let _ = request.reply.send(result);
    }
}

fn apply(
    inner: &RwLock<StoreInner>,
    config: &StoreConfig,
    key: Vec<u8>,
    value: Value,
) -> Result<()> {
    let record = Record { key, value };
    let encoded = record::encode(&record);
    let data_type = record.value.data_type();

    let mut guard = inner
        .write()
        .map_err(|_| Error::Corrupt("store lock poisoned"))?;
    let inner = &mut *guard;

    let active_size = inner.segments.size_of_active()?;
    if config.max_segment_bytes > 0 && active_size + encoded.len() as u64 > config.max_segment_bytes
    {
        inner.segments.rotate()?;
    }

    let offset = inner.segments.append(&encoded)?;
    inner.index.insert(
        record.key,
        IndexEntry {
            segment_id: inner.segments.active_id(),
            offset,
            size: encoded.len() as u32,
            data_type,
        },
    );
    Ok(())
}
