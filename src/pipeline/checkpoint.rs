use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::analysis::features::AudioFeatures;
use crate::error::{AnalysisError, Result};
use crate::mood::unix_millis;

/// Longest a forced write may block the caller.
const FORCE_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_QUEUE: usize = 4;

/// Resumable state of a long analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub key: String,
    /// Fraction of the source already analyzed (0.0-1.0)
    pub progress: f32,
    /// Features of the analyzed prefix
    pub features: AudioFeatures,
    pub timestamp_ms: u64,
}

impl Checkpoint {
    pub fn new(key: impl Into<String>, progress: f32, features: AudioFeatures) -> Self {
        Self {
            key: key.into(),
            progress: progress.clamp(0.0, 1.0),
            features,
            timestamp_ms: unix_millis(),
        }
    }
}

/// Key-value persistence for checkpoints.
pub trait CheckpointStore: Send + Sync {
    fn put(&self, checkpoint: &Checkpoint) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Checkpoint>>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// One JSON file per key.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// `<data dir>/moodscope/checkpoints`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("moodscope").join("checkpoints"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !key.starts_with('.');
        if !valid {
            return Err(AnalysisError::BufferProcessingFailed(format!(
                "invalid checkpoint key '{}'",
                key
            )));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn put(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.key)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(key)?;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn put(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(checkpoint.key.clone(), checkpoint.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

enum WriteRequest {
    Save(Checkpoint),
    Sync(Checkpoint, Sender<Result<()>>),
    Remove(String, Sender<Result<()>>),
}

/// Rate-limited checkpoint writer.
///
/// Periodic saves are handed to a background thread and dropped if it is
/// behind; [`force`](Self::force) goes through the same queue, so it is
/// never overtaken by an older periodic save, and waits for the write.
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    interval: Duration,
    last: Mutex<Option<Instant>>,
    queue: Option<Sender<WriteRequest>>,
    writer: Option<JoinHandle<()>>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn CheckpointStore>, interval: Duration) -> Self {
        let (tx, rx) = bounded::<WriteRequest>(WRITE_QUEUE);
        let writer_store = store.clone();
        let writer = thread::Builder::new()
            .name("checkpoint-writer".to_string())
            .spawn(move || {
                for request in rx {
                    match request {
                        WriteRequest::Save(cp) => {
                            if let Err(e) = writer_store.put(&cp) {
                                log::warn!("Checkpoint write for {} failed: {}", cp.key, e);
                            } else {
                                log::debug!("Checkpoint {} at {:.0}%", cp.key, cp.progress * 100.0);
                            }
                        }
                        WriteRequest::Sync(cp, ack) => {
                            let _ = ack.send(writer_store.put(&cp));
                        }
                        WriteRequest::Remove(key, ack) => {
                            let _ = ack.send(writer_store.remove(&key));
                        }
                    }
                }
            });
        let (queue, writer) = match writer {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                log::warn!("Checkpoint writer thread unavailable, writing inline: {}", e);
                (None, None)
            }
        };
        Self {
            store,
            interval,
            last: Mutex::new(None),
            queue,
            writer,
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True when a periodic save is due. The first call starts the clock.
    pub fn due(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            None => {
                *last = Some(Instant::now());
                false
            }
            Some(t) => t.elapsed() >= self.interval,
        }
    }

    /// Queues a save if the interval has elapsed and `checkpoint` produces
    /// one. Never blocks; returns whether a save was queued.
    pub fn maybe_save(&self, checkpoint: impl FnOnce() -> Option<Checkpoint>) -> bool {
        if !self.due() {
            return false;
        }
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        let Some(cp) = checkpoint() else {
            return false;
        };
        match &self.queue {
            Some(queue) => match queue.try_send(WriteRequest::Save(cp)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::debug!("Checkpoint writer busy, skipping periodic save");
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            None => self.store.put(&cp).is_ok(),
        }
    }

    /// Writes immediately and waits (up to a bound) for the result.
    pub fn force(&self, checkpoint: Checkpoint) -> Result<()> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        let Some(queue) = &self.queue else {
            return self.store.put(&checkpoint);
        };
        let (ack_tx, ack_rx) = bounded(1);
        Self::round_trip(queue, WriteRequest::Sync(checkpoint, ack_tx), ack_rx)
    }

    fn round_trip(queue: &Sender<WriteRequest>, request: WriteRequest, ack: Receiver<Result<()>>) -> Result<()> {
        queue
            .send_timeout(request, FORCE_TIMEOUT)
            .map_err(|_| AnalysisError::BufferProcessingFailed("checkpoint writer unavailable".into()))?;
        ack.recv_timeout(FORCE_TIMEOUT)
            .map_err(|_| AnalysisError::BufferProcessingFailed("checkpoint write timed out".into()))?
    }

    pub fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        self.store.get(key)
    }

    /// Removes the checkpoint after any queued save for it has landed.
    pub fn clear(&self, key: &str) -> Result<()> {
        let Some(queue) = &self.queue else {
            return self.store.remove(key);
        };
        let (ack_tx, ack_rx) = bounded(1);
        Self::round_trip(queue, WriteRequest::Remove(key.to_string(), ack_tx), ack_rx)
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.queue.take();
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}
