use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;

use crate::config::BrokerConfig;
use crate::logging::{LogLevel, Logger};
use crate::storage::{QueueStore, StorageError};
use crate::wire::packet::{Command, Packet};
use crate::wire::session::{
    Request, Submission, WorkNotice, INVALID_FUNCTION_CODE, JOB_FINISHED_CODE,
    NOT_ASSIGNED_CODE, PROTOCOL_ERROR_CODE, QUEUE_STORE_CODE, UNKNOWN_JOB_CODE,
};

use super::jobs::{HandleAllocator, Job, JobError, JobState, NewJob, Outcome, Progress};
use super::registry::FunctionRegistry;
use super::ConnectionId;

const LOG_CONTEXT: &str = "orchestrator::dispatcher";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub handle_prefix: String,
    /// Upper bound on sleepers woken per arriving job; 0 wakes all of them.
    pub worker_wakeup: u32,
    pub retention_ms: u64,
}

impl From<&BrokerConfig> for DispatcherConfig {
    fn from(value: &BrokerConfig) -> Self {
        Self {
            handle_prefix: value.handle_prefix.clone(),
            worker_wakeup: value.worker_wakeup,
            retention_ms: value.retention_ms,
        }
    }
}

/// A packet the caller must deliver to `connection_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub connection_id: ConnectionId,
    pub packet: Packet,
}

impl Outbound {
    pub fn new(connection_id: ConnectionId, packet: Packet) -> Self {
        Self {
            connection_id,
            packet,
        }
    }
}

#[derive(Debug)]
pub enum DispatchError {
    InvalidFunction,
    UnknownJob { handle: String },
    NotAssigned { handle: String, worker: ConnectionId },
    JobFinished { handle: String, state: JobState },
    Transition(JobError),
    QueueStore(StorageError),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFunction => INVALID_FUNCTION_CODE,
            Self::UnknownJob { .. } => UNKNOWN_JOB_CODE,
            Self::NotAssigned { .. } => NOT_ASSIGNED_CODE,
            Self::JobFinished { .. } => JOB_FINISHED_CODE,
            Self::Transition(_) => PROTOCOL_ERROR_CODE,
            Self::QueueStore(_) => QUEUE_STORE_CODE,
        }
    }

    pub fn to_packet(&self) -> Packet {
        Packet::error(self.code(), &self.to_string())
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFunction => write!(f, "function name must not be empty"),
            Self::UnknownJob { handle } => write!(f, "job '{handle}' is not known"),
            Self::NotAssigned { handle, worker } => {
                write!(f, "job '{handle}' is not assigned to connection {worker}")
            }
            Self::JobFinished { handle, state } => {
                write!(f, "job '{handle}' already finished as {state}")
            }
            Self::Transition(source) => write!(f, "{source}"),
            Self::QueueStore(source) => write!(f, "queue store failure: {source}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<JobError> for DispatchError {
    fn from(value: JobError) -> Self {
        match value {
            JobError::NotAssigned { handle, worker } => Self::NotAssigned { handle, worker },
            JobError::AlreadyFinished { handle, state } => Self::JobFinished { handle, state },
            other => Self::Transition(other),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherSnapshot {
    pub jobs_by_state: BTreeMap<String, usize>,
    pub queued_by_function: BTreeMap<String, usize>,
    pub capable_by_function: BTreeMap<String, usize>,
    pub workers: usize,
    pub connections: usize,
}

#[derive(Debug, Default)]
struct Peer {
    client_id: Option<String>,
    abilities: Vec<String>,
    // Signalled readiness via NO_JOB or PRE_SLEEP and has not been handed work since.
    ready: bool,
    sleeping: bool,
    noop_sent: bool,
    assigned: BTreeSet<String>,
    observing: BTreeSet<String>,
}

/// Owns every job, the function registry and per-connection bookkeeping. Each call
/// returns the packets it produced; callers deliver them before releasing their lock.
pub struct Dispatcher {
    config: DispatcherConfig,
    logger: Arc<Logger>,
    store: Arc<dyn QueueStore>,
    handles: HandleAllocator,
    jobs: HashMap<String, Job>,
    unique_index: HashMap<(String, String), String>,
    registry: FunctionRegistry,
    peers: BTreeMap<ConnectionId, Peer>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, store: Arc<dyn QueueStore>, logger: Arc<Logger>) -> Self {
        let handles = HandleAllocator::new(&config.handle_prefix);
        Self {
            config,
            logger,
            store,
            handles,
            jobs: HashMap::new(),
            unique_index: HashMap::new(),
            registry: FunctionRegistry::new(),
            peers: BTreeMap::new(),
        }
    }

    pub fn handle_node(&self) -> &str {
        self.handles.node()
    }

    pub fn job(&self, handle: &str) -> Option<&Job> {
        self.jobs.get(handle)
    }

    /// Applies one request and turns a rejection into an ERROR reply to the sender.
    pub fn dispatch(&mut self, connection: ConnectionId, request: Request) -> Vec<Outbound> {
        let result = match request {
            Request::CanDo { function_name } => self.can_do(connection, &function_name),
            Request::CantDo { function_name } => self.cant_do(connection, &function_name),
            Request::ResetAbilities => self.reset_abilities(connection),
            Request::PreSleep => self.pre_sleep(connection),
            Request::Submit(submission) => self.submit(connection, submission),
            Request::GrabJob { include_unique } => self.grab(connection, include_unique),
            Request::WorkStatus {
                handle,
                progress,
                relay,
            } => self.work_status(connection, &handle, progress, &relay),
            Request::WorkNotice { kind, handle, data } => {
                self.work_notice(connection, kind, &handle, &data)
            }
            Request::WorkComplete { handle, result } => {
                self.finish(connection, &handle, Outcome::Complete(result))
            }
            Request::WorkFail { handle } => self.finish(connection, &handle, Outcome::Failed),
            Request::WorkException { handle, data } => {
                self.finish(connection, &handle, Outcome::Exception(data))
            }
            Request::GetStatus { handle } => Ok(self.get_status(connection, &handle)),
            Request::Echo { data } => Ok(vec![Outbound::new(connection, Packet::echo_res(&data))]),
            Request::SetClientId { client_id } => Ok(self.set_client_id(connection, client_id)),
        };

        result.unwrap_or_else(|error| {
            self.logger.log(
                LogLevel::Debug,
                Some(LOG_CONTEXT),
                "Request rejected",
                Some(json!({
                    "connection_id": connection,
                    "code": error.code(),
                    "reason": error.to_string()
                })),
            );
            vec![Outbound::new(connection, error.to_packet())]
        })
    }

    pub fn submit(
        &mut self,
        connection: ConnectionId,
        submission: Submission,
    ) -> Result<Vec<Outbound>, DispatchError> {
        if submission.function_name.is_empty() {
            return Err(DispatchError::InvalidFunction);
        }

        let unique_key = submission.unique_key.filter(|unique| !unique.is_empty());
        if let Some(unique) = &unique_key {
            let index_key = (submission.function_name.clone(), unique.clone());
            if let Some(handle) = self.unique_index.get(&index_key).cloned() {
                if !submission.background {
                    self.observe(connection, &handle);
                }
                self.logger.log(
                    LogLevel::Debug,
                    Some(LOG_CONTEXT),
                    "Submission coalesced into live job",
                    Some(json!({
                        "connection_id": connection,
                        "handle": handle,
                        "function": submission.function_name,
                        "unique": unique
                    })),
                );
                return Ok(vec![Outbound::new(connection, Packet::job_created(&handle))]);
            }
        }

        let (handle, sequence) = self.handles.allocate();
        let mut job = Job::new(
            handle.clone(),
            sequence,
            NewJob {
                function_name: submission.function_name,
                unique_key,
                payload: submission.payload,
                priority: submission.priority,
                background: submission.background,
            },
        );

        if job.background {
            self.store
                .enqueue(&job.to_persisted())
                .map_err(DispatchError::QueueStore)?;
        }
        job.mark_queued()?;

        let function_name = job.function_name.clone();
        self.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Job queued",
            Some(json!({
                "connection_id": connection,
                "handle": handle,
                "function": function_name,
                "priority": job.priority.as_str(),
                "background": job.background
            })),
        );

        let background = job.background;
        self.admit(job);
        if !background {
            self.observe(connection, &handle);
        }

        let mut outbound = vec![Outbound::new(connection, Packet::job_created(&handle))];
        self.wake_sleepers(&function_name, &mut outbound);
        Ok(outbound)
    }

    pub fn grab(
        &mut self,
        connection: ConnectionId,
        include_unique: bool,
    ) -> Result<Vec<Outbound>, DispatchError> {
        let peer = self.peers.entry(connection).or_default();
        peer.sleeping = false;
        peer.noop_sent = false;
        let abilities = peer.abilities.clone();

        let next = abilities
            .iter()
            .filter_map(|function_name| {
                self.registry
                    .head(function_name)
                    .map(|head| (head, function_name))
            })
            .min_by_key(|(head, _)| *head)
            .and_then(|(_, function_name)| self.registry.pop_head(function_name));

        let Some(handle) = next else {
            for function_name in &abilities {
                self.registry.mark_idle(function_name, connection);
            }
            self.peers.entry(connection).or_default().ready = true;
            return Ok(vec![Outbound::new(connection, Packet::no_job())]);
        };

        let job = self
            .jobs
            .get_mut(&handle)
            .ok_or_else(|| DispatchError::UnknownJob {
                handle: handle.clone(),
            })?;
        job.assign(connection)?;

        let packet = if include_unique {
            Packet::job_assign_uniq(
                &job.handle,
                &job.function_name,
                job.unique_key.as_deref().unwrap_or_default(),
                &job.payload,
            )
        } else {
            Packet::job_assign(&job.handle, &job.function_name, &job.payload)
        };
        self.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Job assigned",
            Some(json!({
                "connection_id": connection,
                "handle": job.handle,
                "function": job.function_name,
                "attempt": job.attempts()
            })),
        );

        for function_name in &abilities {
            self.registry.clear_idle(function_name, connection);
        }
        let peer = self.peers.entry(connection).or_default();
        peer.ready = false;
        peer.assigned.insert(handle);

        Ok(vec![Outbound::new(connection, packet)])
    }

    pub fn can_do(
        &mut self,
        connection: ConnectionId,
        function_name: &str,
    ) -> Result<Vec<Outbound>, DispatchError> {
        if function_name.is_empty() {
            return Err(DispatchError::InvalidFunction);
        }

        let peer = self.peers.entry(connection).or_default();
        if !peer.abilities.iter().any(|known| known == function_name) {
            peer.abilities.push(function_name.to_owned());
        }
        let ready = peer.ready;
        self.registry.register(function_name, connection);
        if ready {
            self.registry.mark_idle(function_name, connection);
        }

        let mut outbound = Vec::new();
        self.nudge_if_work_pending(connection, &mut outbound);
        Ok(outbound)
    }

    pub fn cant_do(
        &mut self,
        connection: ConnectionId,
        function_name: &str,
    ) -> Result<Vec<Outbound>, DispatchError> {
        if let Some(peer) = self.peers.get_mut(&connection) {
            peer.abilities.retain(|known| known != function_name);
        }
        self.registry.unregister(function_name, connection);
        Ok(Vec::new())
    }

    /// Drops every ability at once; jobs already running on the connection are untouched.
    pub fn reset_abilities(&mut self, connection: ConnectionId) -> Result<Vec<Outbound>, DispatchError> {
        let abilities = self
            .peers
            .get_mut(&connection)
            .map(|peer| std::mem::take(&mut peer.abilities))
            .unwrap_or_default();
        for function_name in &abilities {
            self.registry.unregister(function_name, connection);
        }
        Ok(Vec::new())
    }

    pub fn pre_sleep(&mut self, connection: ConnectionId) -> Result<Vec<Outbound>, DispatchError> {
        let peer = self.peers.entry(connection).or_default();
        peer.sleeping = true;
        peer.noop_sent = false;
        peer.ready = true;
        let abilities = peer.abilities.clone();
        for function_name in &abilities {
            self.registry.mark_idle(function_name, connection);
        }

        let mut outbound = Vec::new();
        self.nudge_if_work_pending(connection, &mut outbound);
        Ok(outbound)
    }

    pub fn work_status(
        &mut self,
        connection: ConnectionId,
        handle: &str,
        progress: Progress,
        relay: &Packet,
    ) -> Result<Vec<Outbound>, DispatchError> {
        let job = self.job_mut(handle)?;
        job.update_progress(connection, progress)?;
        Ok(fan_out(job, relay))
    }

    pub fn work_notice(
        &mut self,
        connection: ConnectionId,
        kind: WorkNotice,
        handle: &str,
        data: &[u8],
    ) -> Result<Vec<Outbound>, DispatchError> {
        let job = self.job_mut(handle)?;
        job.check_reporter(connection)?;
        let packet = Packet::work_update(kind.command(), handle, data);
        Ok(fan_out(job, &packet))
    }

    pub fn finish(
        &mut self,
        connection: ConnectionId,
        handle: &str,
        outcome: Outcome,
    ) -> Result<Vec<Outbound>, DispatchError> {
        let packet = match &outcome {
            Outcome::Complete(result) => Packet::work_update(Command::WorkComplete, handle, result),
            Outcome::Failed => Packet::work_fail(handle),
            Outcome::Exception(data) => Packet::work_update(Command::WorkException, handle, data),
        };

        let job = self.job_mut(handle)?;
        job.finish(connection, outcome)?;
        let outbound = fan_out(job, &packet);
        let state = job.state();
        let background = job.background;
        let index_key = job
            .unique_key
            .clone()
            .map(|unique| (job.function_name.clone(), unique));

        if let Some(peer) = self.peers.get_mut(&connection) {
            peer.assigned.remove(handle);
        }
        if let Some(index_key) = index_key {
            self.release_unique(index_key, handle);
        }
        if background {
            if let Err(error) = self.store.remove(handle) {
                self.logger.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    "Failed to remove finished background job from queue store",
                    Some(json!({"handle": handle, "error": error.to_string()})),
                );
            }
        }

        self.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Job finished",
            Some(json!({
                "connection_id": connection,
                "handle": handle,
                "state": state.as_str(),
                "observers": outbound.len()
            })),
        );

        if self.config.retention_ms == 0 {
            self.evict(handle);
        }
        Ok(outbound)
    }

    pub fn get_status(&self, connection: ConnectionId, handle: &str) -> Vec<Outbound> {
        let packet = match self.jobs.get(handle) {
            Some(job) => {
                let progress = job.progress();
                Packet::status_res(
                    handle,
                    true,
                    job.state() == JobState::Running,
                    progress.numerator,
                    progress.denominator,
                )
            }
            None => Packet::status_res(handle, false, false, 0, 0),
        };
        vec![Outbound::new(connection, packet)]
    }

    pub fn set_client_id(&mut self, connection: ConnectionId, client_id: String) -> Vec<Outbound> {
        self.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Client id set",
            Some(json!({"connection_id": connection, "client_id": client_id})),
        );
        self.peers.entry(connection).or_default().client_id = Some(client_id);
        Vec::new()
    }

    pub fn client_id(&self, connection: ConnectionId) -> Option<&str> {
        self.peers
            .get(&connection)
            .and_then(|peer| peer.client_id.as_deref())
    }

    /// Stops `connection` from observing `handle`. A finished job nobody observes is evicted.
    pub fn abandon(&mut self, connection: ConnectionId, handle: &str) -> Result<(), DispatchError> {
        let job = self.job_mut(handle)?;
        job.remove_owner(connection);
        let evictable = !job.is_live() && !job.has_owners();

        if let Some(peer) = self.peers.get_mut(&connection) {
            peer.observing.remove(handle);
        }
        if evictable {
            self.evict(handle);
        }
        Ok(())
    }

    /// Cleans up after a connection that went away: its running jobs go back to the front
    /// of their tier and it stops observing everything it submitted.
    pub fn connection_closed(&mut self, connection: ConnectionId) -> Vec<Outbound> {
        let Some(peer) = self.peers.remove(&connection) else {
            return Vec::new();
        };

        for function_name in &peer.abilities {
            self.registry.unregister(function_name, connection);
        }

        let mut running = peer
            .assigned
            .iter()
            .filter_map(|handle| self.jobs.get(handle).map(|job| (job.sequence, handle.clone())))
            .collect::<Vec<_>>();
        // Pushing to the front in reverse keeps the original relative order.
        running.sort_unstable_by(|left, right| right.0.cmp(&left.0));

        let mut outbound = Vec::new();
        for (_, handle) in running {
            let Some(job) = self.jobs.get_mut(&handle) else {
                continue;
            };
            if let Err(error) = job.requeue() {
                self.logger.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    "Could not requeue job of closed connection",
                    Some(json!({"handle": handle, "error": error.to_string()})),
                );
                continue;
            }

            let function_name = job.function_name.clone();
            self.registry
                .push_front(&function_name, job.priority, job.sequence, &handle);
            self.logger.log(
                LogLevel::Info,
                Some(LOG_CONTEXT),
                "Job requeued after worker disconnect",
                Some(json!({
                    "connection_id": connection,
                    "handle": handle,
                    "function": function_name
                })),
            );
            self.wake_sleepers(&function_name, &mut outbound);
        }

        for handle in &peer.observing {
            let Some(job) = self.jobs.get_mut(handle) else {
                continue;
            };
            job.remove_owner(connection);
            if !job.is_live() && !job.has_owners() {
                self.evict(handle);
            }
        }

        outbound
    }

    /// Evicts finished jobs whose retention window elapsed by `now`.
    pub fn sweep_retained(&mut self, now: DateTime<Utc>) -> usize {
        let retention_ms = i64::try_from(self.config.retention_ms).unwrap_or(i64::MAX);
        let retention = Duration::milliseconds(retention_ms);
        let expired = self
            .jobs
            .values()
            .filter(|job| {
                job.finished_at()
                    .and_then(|finished_at| finished_at.checked_add_signed(retention))
                    .is_some_and(|expires_at| expires_at <= now)
            })
            .map(|job| job.handle.clone())
            .collect::<Vec<_>>();

        for handle in &expired {
            self.evict(handle);
        }
        expired.len()
    }

    /// Re-admits every durable background job that this process does not hold yet.
    pub fn restore_from_store(&mut self) -> Result<usize, DispatchError> {
        let mut restored = 0usize;
        for function_name in self.store.functions().map_err(DispatchError::QueueStore)? {
            while let Some(record) = self
                .store
                .dequeue_next(&function_name)
                .map_err(DispatchError::QueueStore)?
            {
                if self.jobs.contains_key(&record.handle) {
                    continue;
                }
                self.handles.observe(record.sequence);
                let mut job = Job::from_persisted(record);
                job.mark_queued()?;
                self.admit(job);
                restored += 1;
            }
        }

        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Background jobs restored from queue store",
            Some(json!({"restored": restored})),
        );
        Ok(restored)
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        let mut jobs_by_state = BTreeMap::new();
        for job in self.jobs.values() {
            *jobs_by_state.entry(job.state().as_str().to_owned()).or_insert(0) += 1;
        }

        DispatcherSnapshot {
            jobs_by_state,
            queued_by_function: self.registry.pending_by_function(),
            capable_by_function: self
                .registry
                .function_names()
                .into_iter()
                .map(|function_name| {
                    let capable = self.registry.capable_workers(&function_name);
                    (function_name, capable)
                })
                .filter(|(_, capable)| *capable > 0)
                .collect(),
            workers: self
                .peers
                .values()
                .filter(|peer| !peer.abilities.is_empty())
                .count(),
            connections: self.peers.len(),
        }
    }

    fn job_mut(&mut self, handle: &str) -> Result<&mut Job, DispatchError> {
        self.jobs
            .get_mut(handle)
            .ok_or_else(|| DispatchError::UnknownJob {
                handle: handle.to_owned(),
            })
    }

    fn admit(&mut self, job: Job) {
        if let Some(unique) = &job.unique_key {
            self.unique_index
                .entry((job.function_name.clone(), unique.clone()))
                .or_insert_with(|| job.handle.clone());
        }
        self.registry
            .push_back(&job.function_name, job.priority, job.sequence, &job.handle);
        self.jobs.insert(job.handle.clone(), job);
    }

    fn observe(&mut self, connection: ConnectionId, handle: &str) {
        if let Some(job) = self.jobs.get_mut(handle) {
            job.add_owner(connection);
            self.peers
                .entry(connection)
                .or_default()
                .observing
                .insert(handle.to_owned());
        }
    }

    fn release_unique(&mut self, index_key: (String, String), handle: &str) {
        if self
            .unique_index
            .get(&index_key)
            .is_some_and(|indexed| indexed == handle)
        {
            self.unique_index.remove(&index_key);
        }
    }

    fn evict(&mut self, handle: &str) {
        let Some(job) = self.jobs.remove(handle) else {
            return;
        };
        for owner in job.owners() {
            if let Some(peer) = self.peers.get_mut(&owner) {
                peer.observing.remove(handle);
            }
        }
        if let Some(unique) = job.unique_key.clone() {
            self.release_unique((job.function_name.clone(), unique), handle);
        }
        self.logger.log(
            LogLevel::Verbose,
            Some(LOG_CONTEXT),
            "Job evicted",
            Some(json!({"handle": handle, "state": job.state().as_str()})),
        );
    }

    fn wake_sleepers(&mut self, function_name: &str, outbound: &mut Vec<Outbound>) {
        let limit = match self.config.worker_wakeup {
            0 => usize::MAX,
            cap => cap as usize,
        };

        let mut woken = 0usize;
        for worker in self.registry.idle_workers(function_name) {
            if woken >= limit {
                break;
            }
            let Some(peer) = self.peers.get_mut(&worker) else {
                continue;
            };
            if !peer.sleeping || peer.noop_sent {
                continue;
            }
            peer.noop_sent = true;
            outbound.push(Outbound::new(worker, Packet::noop()));
            woken += 1;
        }
    }

    // A sleeper that declares work which is already waiting is told right away.
    fn nudge_if_work_pending(&mut self, connection: ConnectionId, outbound: &mut Vec<Outbound>) {
        let Some(peer) = self.peers.get(&connection) else {
            return;
        };
        if !peer.sleeping || peer.noop_sent {
            return;
        }
        let pending = peer
            .abilities
            .iter()
            .any(|function_name| self.registry.has_pending(function_name));
        if pending {
            if let Some(peer) = self.peers.get_mut(&connection) {
                peer.noop_sent = true;
            }
            outbound.push(Outbound::new(connection, Packet::noop()));
        }
    }
}

fn fan_out(job: &Job, packet: &Packet) -> Vec<Outbound> {
    job.owners()
        .map(|owner| Outbound::new(owner, packet.clone()))
        .collect()
}
