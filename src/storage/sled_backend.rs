use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Mutex;

use super::backend::{
    function_from_queue_key, function_prefix, handle_key, queue_key, QUEUE_PREFIX,
};
use super::{PersistedJob, QueueStore, SledMode, StorageError};

pub struct SledQueueStore {
    db: sled::Db,
    handed_out: Mutex<HashSet<String>>,
}

impl SledQueueStore {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        if let Some(mode) = mode {
            config = config.mode(match mode {
                SledMode::LowSpace => sled::Mode::LowSpace,
                SledMode::HighThroughput => sled::Mode::HighThroughput,
            });
        }

        let db = config.open().map_err(StorageError::Sled)?;
        Ok(Self {
            db,
            handed_out: Mutex::new(HashSet::new()),
        })
    }

    fn decode_record(raw: &[u8]) -> Result<PersistedJob, StorageError> {
        serde_json::from_slice(raw).map_err(StorageError::DeserializeJob)
    }
}

impl QueueStore for SledQueueStore {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }

    fn enqueue(&self, job: &PersistedJob) -> Result<(), StorageError> {
        let record = serde_json::to_vec(job).map_err(StorageError::SerializeJob)?;
        let key = queue_key(job);

        let mut batch = sled::Batch::default();
        batch.insert(key.clone(), record);
        batch.insert(handle_key(&job.handle), key);
        self.db.apply_batch(batch).map_err(StorageError::Sled)?;

        self.handed_out
            .lock()
            .expect("sled handed-out set lock poisoned")
            .insert(job.handle.clone());
        Ok(())
    }

    fn dequeue_next(&self, function_name: &str) -> Result<Option<PersistedJob>, StorageError> {
        let mut handed_out = self
            .handed_out
            .lock()
            .expect("sled handed-out set lock poisoned");

        for entry in self.db.scan_prefix(function_prefix(function_name)) {
            let (_, value) = entry.map_err(StorageError::Sled)?;
            let job = Self::decode_record(value.as_ref())?;
            if handed_out.insert(job.handle.clone()) {
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    fn remove(&self, handle: &str) -> Result<(), StorageError> {
        let index_key = handle_key(handle);
        let Some(indexed_key) = self.db.get(&index_key).map_err(StorageError::Sled)? else {
            return Ok(());
        };

        let mut batch = sled::Batch::default();
        batch.remove(indexed_key);
        batch.remove(index_key);
        self.db.apply_batch(batch).map_err(StorageError::Sled)?;

        self.handed_out
            .lock()
            .expect("sled handed-out set lock poisoned")
            .remove(handle);
        Ok(())
    }

    fn functions(&self) -> Result<Vec<String>, StorageError> {
        let mut functions = BTreeSet::new();
        for entry in self.db.scan_prefix(QUEUE_PREFIX) {
            let (key, _) = entry.map_err(StorageError::Sled)?;
            let function = function_from_queue_key(key.as_ref()).ok_or_else(|| {
                StorageError::CorruptKey {
                    key: String::from_utf8_lossy(key.as_ref()).to_string(),
                }
            })?;
            functions.insert(function);
        }
        Ok(functions.into_iter().collect())
    }
}
