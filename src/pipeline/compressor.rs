//! Compressor pool: one zstd frame per object, on dedicated threads.

use bytes::Bytes;
use std::{io, sync::Arc, thread};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::{
    Fetched, Outcome, Settled,
    state::{PipelineState, StageCounters},
};
use crate::models::archive::{CompressedEntry, FailedObject, FailureStage, FetchedObject};

const TRACING_TARGET: &str = "cold_archiver::pipeline::compressor";

/// Compress one object. Pure and deterministic for a given level, which is
/// what lets a volume be rebuilt byte for byte later.
pub fn compress(object: &FetchedObject, level: i32) -> Result<CompressedEntry, FailedObject> {
    let payload = zstd::stream::encode_all(&object.data[..], level).map_err(|err| {
        FailedObject::new(&object.key.name, FailureStage::Compress, err.to_string())
    })?;
    Ok(CompressedEntry {
        key: object.key.clone(),
        compressed_size: payload.len() as u64,
        payload: Bytes::from(payload),
        original_size: object.data.len() as u64,
        checksum: xxh3_64(&object.data),
    })
}

/// Start `count` compressor threads.
///
/// Each thread releases the object's byte budget as soon as it is
/// compressed, then forwards the entry. Threads exit once `fetched` is
/// disconnected and empty, or when `settled` has no receiver left. A
/// thread that panics cancels `halt`.
pub(crate) fn spawn(
    count: usize,
    level: i32,
    fetched: flume::Receiver<Fetched>,
    settled: flume::Sender<Settled>,
    state: Arc<PipelineState>,
    halt: CancellationToken,
) -> io::Result<Vec<thread::JoinHandle<()>>> {
    (0..count)
        .map(|worker| {
            let fetched = fetched.clone();
            let settled = settled.clone();
            let state = Arc::clone(&state);
            let halt = halt.clone();
            thread::Builder::new()
                .name(format!("compress-{worker}"))
                .spawn(move || run(worker, level, fetched, settled, state, halt))
        })
        .collect()
}

fn run(
    worker: usize,
    level: i32,
    fetched: flume::Receiver<Fetched>,
    settled: flume::Sender<Settled>,
    state: Arc<PipelineState>,
    halt: CancellationToken,
) {
    let guard = halt.drop_guard();
    while let Ok(Fetched {
        ordinal,
        object,
        ticket,
        budget,
    }) = fetched.recv()
    {
        let outcome = match compress(&object, level) {
            Ok(entry) => {
                StageCounters::bump(&state.counters.compressed);
                Outcome::Archived(entry)
            }
            Err(failure) => {
                warn!(target: TRACING_TARGET, key = %failure.key, reason = %failure.reason, "compression failed");
                StageCounters::bump(&state.counters.failed);
                Outcome::Failed(failure)
            }
        };
        drop(object);
        drop(budget);

        let message = Settled {
            ordinal,
            outcome,
            ticket,
        };
        if settled.send(message).is_err() {
            break;
        }
    }
    guard.disarm();
    debug!(target: TRACING_TARGET, worker, "compressor stopped");
}
