use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use super::backend::{function_from_queue_key, function_prefix, queue_key};
use super::{PersistedJob, QueueStore, StorageError};

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<Vec<u8>, PersistedJob>,
    handles: HashMap<String, Vec<u8>>,
    handed_out: HashSet<String>,
}

/// Volatile engine with the same ordering rules as the sled store.
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<MemoryState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets which records were handed out, as if the store had just been reopened.
    pub fn reopen(&self) {
        self.state
            .lock()
            .expect("memory store lock poisoned")
            .handed_out
            .clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("memory store lock poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueueStore for MemoryQueueStore {
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn enqueue(&self, job: &PersistedJob) -> Result<(), StorageError> {
        let key = queue_key(job);
        let mut state = self.state.lock().expect("memory store lock poisoned");
        state.records.insert(key.clone(), job.clone());
        state.handles.insert(job.handle.clone(), key);
        state.handed_out.insert(job.handle.clone());
        Ok(())
    }

    fn dequeue_next(&self, function_name: &str) -> Result<Option<PersistedJob>, StorageError> {
        let prefix = function_prefix(function_name);
        let mut state = self.state.lock().expect("memory store lock poisoned");
        let MemoryState {
            records,
            handed_out,
            ..
        } = &mut *state;

        let next = records
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, job)| job)
            .find(|job| !handed_out.contains(&job.handle))
            .cloned();

        if let Some(job) = &next {
            handed_out.insert(job.handle.clone());
        }
        Ok(next)
    }

    fn remove(&self, handle: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        if let Some(key) = state.handles.remove(handle) {
            state.records.remove(&key);
        }
        state.handed_out.remove(handle);
        Ok(())
    }

    fn functions(&self) -> Result<Vec<String>, StorageError> {
        let state = self.state.lock().expect("memory store lock poisoned");
        let functions = state
            .records
            .keys()
            .filter_map(|key| function_from_queue_key(key))
            .collect::<BTreeSet<_>>();
        Ok(functions.into_iter().collect())
    }
}
