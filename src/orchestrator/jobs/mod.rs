use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::PersistedJob;

use super::ConnectionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

pub const PRIORITY_TIERS: usize = 3;

impl Priority {
    /// Queue tier index; lower tiers are served first.
    pub fn tier(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobState {
    New,
    Queued,
    Running,
    Complete,
    Failed,
    Exception,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Exception)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Exception => "exception",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub numerator: u32,
    pub denominator: u32,
}

/// How a running job ended, as reported by its worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Complete(Vec<u8>),
    Failed,
    Exception(Vec<u8>),
}

impl Outcome {
    fn state(&self) -> JobState {
        match self {
            Self::Complete(_) => JobState::Complete,
            Self::Failed => JobState::Failed,
            Self::Exception(_) => JobState::Exception,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewJob {
    pub function_name: String,
    pub unique_key: Option<String>,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub background: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum JobError {
    InvalidTransition {
        handle: String,
        from: JobState,
        to: JobState,
    },
    NotAssigned {
        handle: String,
        worker: ConnectionId,
    },
    AlreadyFinished {
        handle: String,
        state: JobState,
    },
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { handle, from, to } => {
                write!(f, "job '{handle}' cannot move from {from} to {to}")
            }
            Self::NotAssigned { handle, worker } => {
                write!(f, "job '{handle}' is not assigned to connection {worker}")
            }
            Self::AlreadyFinished { handle, state } => {
                write!(f, "job '{handle}' already finished as {state}")
            }
        }
    }
}

impl std::error::Error for JobError {}

#[derive(Clone, Debug)]
pub struct Job {
    pub handle: String,
    pub function_name: String,
    pub unique_key: Option<String>,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub background: bool,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    state: JobState,
    progress: Progress,
    result: Option<Vec<u8>>,
    exception: Option<Vec<u8>>,
    owners: BTreeSet<ConnectionId>,
    assigned_worker: Option<ConnectionId>,
    attempts: u32,
    finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(handle: String, sequence: u64, new_job: NewJob) -> Self {
        Self {
            handle,
            function_name: new_job.function_name,
            unique_key: new_job.unique_key.filter(|unique| !unique.is_empty()),
            payload: new_job.payload,
            priority: new_job.priority,
            background: new_job.background,
            sequence,
            created_at: Utc::now(),
            state: JobState::New,
            progress: Progress::default(),
            result: None,
            exception: None,
            owners: BTreeSet::new(),
            assigned_worker: None,
            attempts: 0,
            finished_at: None,
        }
    }

    /// Rebuilds a background job from its durable image. It comes back in `New`.
    pub fn from_persisted(record: PersistedJob) -> Self {
        Self {
            handle: record.handle,
            function_name: record.function_name,
            unique_key: record.unique_key,
            payload: record.payload,
            priority: record.priority,
            background: true,
            sequence: record.sequence,
            created_at: record.created_at,
            state: JobState::New,
            progress: Progress::default(),
            result: None,
            exception: None,
            owners: BTreeSet::new(),
            assigned_worker: None,
            attempts: 0,
            finished_at: None,
        }
    }

    pub fn to_persisted(&self) -> PersistedJob {
        PersistedJob {
            handle: self.handle.clone(),
            function_name: self.function_name.clone(),
            unique_key: self.unique_key.clone(),
            priority: self.priority,
            sequence: self.sequence,
            payload: self.payload.clone(),
            created_at: self.created_at,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn result(&self) -> Option<&[u8]> {
        self.result.as_deref()
    }

    pub fn exception(&self) -> Option<&[u8]> {
        self.exception.as_deref()
    }

    pub fn assigned_worker(&self) -> Option<ConnectionId> {
        self.assigned_worker
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn owners(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.owners.iter().copied()
    }

    pub fn has_owners(&self) -> bool {
        !self.owners.is_empty()
    }

    pub fn add_owner(&mut self, connection: ConnectionId) -> bool {
        self.owners.insert(connection)
    }

    pub fn remove_owner(&mut self, connection: ConnectionId) -> bool {
        self.owners.remove(&connection)
    }

    pub fn mark_queued(&mut self) -> Result<(), JobError> {
        self.transition(JobState::New, JobState::Queued)
    }

    pub fn assign(&mut self, worker: ConnectionId) -> Result<(), JobError> {
        self.transition(JobState::Queued, JobState::Running)?;
        self.assigned_worker = Some(worker);
        self.attempts += 1;
        Ok(())
    }

    /// Puts a running job back in the queue after its worker went away.
    pub fn requeue(&mut self) -> Result<(), JobError> {
        self.transition(JobState::Running, JobState::Queued)?;
        self.assigned_worker = None;
        Ok(())
    }

    /// Confirms `worker` may report on this job right now.
    pub fn check_reporter(&self, worker: ConnectionId) -> Result<(), JobError> {
        if self.state.is_terminal() {
            return Err(JobError::AlreadyFinished {
                handle: self.handle.clone(),
                state: self.state,
            });
        }
        if self.state != JobState::Running || self.assigned_worker != Some(worker) {
            return Err(JobError::NotAssigned {
                handle: self.handle.clone(),
                worker,
            });
        }
        Ok(())
    }

    pub fn update_progress(
        &mut self,
        worker: ConnectionId,
        progress: Progress,
    ) -> Result<(), JobError> {
        self.check_reporter(worker)?;
        self.progress = progress;
        Ok(())
    }

    pub fn finish(&mut self, worker: ConnectionId, outcome: Outcome) -> Result<(), JobError> {
        self.check_reporter(worker)?;
        self.state = outcome.state();
        match outcome {
            Outcome::Complete(result) => self.result = Some(result),
            Outcome::Exception(data) => self.exception = Some(data),
            Outcome::Failed => {}
        }
        self.assigned_worker = None;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, from: JobState, to: JobState) -> Result<(), JobError> {
        if self.state.is_terminal() {
            return Err(JobError::AlreadyFinished {
                handle: self.handle.clone(),
                state: self.state,
            });
        }
        if self.state != from {
            return Err(JobError::InvalidTransition {
                handle: self.handle.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Hands out `H:<node>:<sequence>` handles together with the submission sequence.
#[derive(Debug)]
pub struct HandleAllocator {
    node: String,
    next_sequence: u64,
}

impl HandleAllocator {
    pub fn new(prefix: &str) -> Self {
        let node = if prefix.trim().is_empty() {
            Uuid::new_v4().simple().to_string()[..12].to_owned()
        } else {
            prefix.trim().to_owned()
        };

        Self {
            node,
            next_sequence: 1,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn allocate(&mut self) -> (String, u64) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        (format!("H:{}:{sequence}", self.node), sequence)
    }

    /// Keeps future sequences ahead of one replayed from storage.
    pub fn observe(&mut self, sequence: u64) {
        if sequence >= self.next_sequence {
            self.next_sequence = sequence + 1;
        }
    }
}
