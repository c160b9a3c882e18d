//! The durability loop: debounced, atomic-replace snapshot flushes.
//!
//! One loop runs per collection on the server role. It blocks on the union
//! of the dirty and close signals; a dirty wake triggers one flush followed
//! by a debounce sleep so bursts of writes coalesce into one snapshot, and
//! close drains at most one final flush before terminating.
//!
//! A flush never rewrites `<name>.dat` in place: records are written and
//! fsynced to `<name>.new`, the old snapshot is moved aside to `<name>.tmp`,
//! and the new file is renamed over `<name>.dat`, so no partially-written
//! snapshot is ever observable.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::store::collection::Collection;

/// The three on-disk paths a collection's snapshot cycles through.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotPaths {
    /// Committed snapshot.
    pub(crate) dat: PathBuf,
    /// Write target during a flush.
    pub(crate) new: PathBuf,
    /// Parking spot for the previous snapshot during the rename.
    pub(crate) tmp: PathBuf,
}

impl SnapshotPaths {
    pub(crate) fn new(root: &Path, name: &str) -> Self {
        Self {
            dat: root.join(format!("{name}.dat")),
            new: root.join(format!("{name}.new")),
            tmp: root.join(format!("{name}.tmp")),
        }
    }
}

/// Runs the persistence loop for one collection until close.
pub(crate) fn spawn_flush_loop(collection: Arc<Collection>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut close_rx = collection.close_rx.clone();

        loop {
            if *close_rx.borrow() {
                if collection.store.dirty_take() {
                    run_flush(&collection).await;
                }
                break;
            }

            tokio::select! {
                () = collection.store.dirty_wait() => {
                    collection.store.dirty_take();
                    run_flush(&collection).await;
                    tokio::time::sleep(collection.debounce).await;
                }
                _ = close_rx.changed() => {}
            }
        }

        debug!(collection = %collection.name(), "persistence loop terminated");
    })
}

async fn run_flush(collection: &Arc<Collection>) {
    let target = Arc::clone(collection);
    match tokio::task::spawn_blocking(move || flush(&target)).await {
        Ok(Ok(written)) => {
            trace!(collection = %collection.name(), written, "snapshot flushed");
        }
        Ok(Err(error)) => {
            warn!(
                collection = %collection.name(),
                %error,
                "snapshot flush failed; retrying on next write"
            );
        }
        Err(error) => {
            warn!(collection = %collection.name(), %error, "snapshot flush task failed");
        }
    }
}

/// Writes one snapshot via the atomic-replace protocol.
///
/// Records land on disk sorted by key, two lines each: the key, then the
/// single-line JSON value.
pub(crate) fn flush(collection: &Collection) -> io::Result<usize> {
    let _guard = collection.flush_lock.lock();

    let mut records = collection.snapshot_records();
    records.sort_by(|a, b| a.0.cmp(&b.0));

    let file = File::create(&collection.paths.new)?;
    let mut writer = BufWriter::new(file);
    for (key, json) in &records {
        writer.write_all(key.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.write_all(json.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()?;
    drop(file);

    match fs::rename(&collection.paths.dat, &collection.paths.tmp) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }
    fs::rename(&collection.paths.new, &collection.paths.dat)?;
    let _ = fs::remove_file(&collection.paths.tmp);

    let written = records.len();
    collection
        .store
        .set_count(i64::try_from(written).unwrap_or(i64::MAX));
    Ok(written)
}

/// Reads the committed snapshot into the record store.
///
/// An absent file means the collection starts empty. Loaded records do not
/// touch the LWW clock table.
pub(crate) fn load_from_disk(collection: &Collection) -> io::Result<usize> {
    let file = match File::open(&collection.paths.dat) {
        Ok(file) => file,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(error) => return Err(error),
    };

    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut loaded = 0_usize;

    while let Some(key) = lines.next() {
        let key = key?;
        let Some(json) = lines.next() else {
            warn!(collection = %collection.name(), "snapshot ends with an orphaned key line");
            break;
        };
        let json = json?;

        match collection.descriptor().decode(&json) {
            Ok(record) => {
                collection.store.insert_loaded(key, record);
                loaded += 1;
            }
            Err(error) => {
                warn!(collection = %collection.name(), key, %error, "skipping undecodable snapshot record");
            }
        }
    }

    collection
        .store
        .set_count(i64::try_from(loaded).unwrap_or(i64::MAX));
    Ok(loaded)
}
