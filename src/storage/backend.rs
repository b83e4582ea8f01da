use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::orchestrator::jobs::Priority;

use super::StorageError;

pub(crate) const QUEUE_PREFIX: &[u8] = b"v1:q:";
pub(crate) const HANDLE_PREFIX: &[u8] = b"v1:h:";

/// Durable image of a background job.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedJob {
    pub handle: String,
    pub function_name: String,
    pub unique_key: Option<String>,
    pub priority: Priority,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Durability collaborator for background jobs. The dispatcher's in-memory registry stays
/// authoritative; the store is only written on submit and completion and read back on restore.
pub trait QueueStore: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;

    /// Persists the job and marks it as already held by this process.
    fn enqueue(&self, job: &PersistedJob) -> Result<(), StorageError>;

    /// Next durable record for `function_name` (priority tier, then sequence) that has not been
    /// handed out since the store was opened. The record stays durable until `remove`.
    fn dequeue_next(&self, function_name: &str) -> Result<Option<PersistedJob>, StorageError>;

    fn remove(&self, handle: &str) -> Result<(), StorageError>;

    fn functions(&self) -> Result<Vec<String>, StorageError>;
}

pub(crate) fn function_prefix(function_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(QUEUE_PREFIX.len() + function_name.len() + 1);
    key.extend_from_slice(QUEUE_PREFIX);
    key.extend_from_slice(function_name.as_bytes());
    key.push(0);
    key
}

pub(crate) fn queue_key(job: &PersistedJob) -> Vec<u8> {
    let mut key = function_prefix(&job.function_name);
    key.extend_from_slice(format!("{}{:020}", job.priority.tier(), job.sequence).as_bytes());
    key
}

pub(crate) fn handle_key(handle: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(HANDLE_PREFIX.len() + handle.len());
    key.extend_from_slice(HANDLE_PREFIX);
    key.extend_from_slice(handle.as_bytes());
    key
}

pub(crate) fn function_from_queue_key(key: &[u8]) -> Option<String> {
    let rest = key.strip_prefix(QUEUE_PREFIX)?;
    let end = rest.iter().position(|byte| *byte == 0)?;
    String::from_utf8(rest[..end].to_vec()).ok()
}
