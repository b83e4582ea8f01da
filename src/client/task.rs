use std::any::Any;
use std::fmt;

use crate::orchestrator::jobs::Priority;
use crate::wire::packet::{Command, Packet, PacketError};

use super::ClientError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    New,
    Submitted,
    Complete,
    Failed,
    Exception,
    Rejected,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Exception | Self::Rejected
        )
    }
}

type Cleanup = Box<dyn FnOnce(Box<dyn Any + Send>) + Send>;

/// Caller-owned value attached to a task. The cleanup closure receives the value back
/// exactly once, when the context is dropped.
struct TaskContext {
    value: Option<Box<dyn Any + Send>>,
    cleanup: Option<Cleanup>,
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        if let (Some(value), Some(cleanup)) = (self.value.take(), self.cleanup.take()) {
            cleanup(value);
        }
    }
}

/// Client-side view of one submitted unit of work.
pub struct Task {
    function_name: String,
    unique_key: Option<String>,
    priority: Priority,
    background: bool,
    workload: Vec<u8>,
    status: TaskStatus,
    handle: Option<String>,
    known: bool,
    running: bool,
    numerator: u32,
    denominator: u32,
    result: Option<Vec<u8>>,
    exception: Option<Vec<u8>>,
    error: Option<String>,
    data: Vec<Vec<u8>>,
    warnings: Vec<Vec<u8>>,
    context: Option<TaskContext>,
}

impl Task {
    pub fn new(
        function_name: impl Into<String>,
        unique_key: Option<String>,
        priority: Priority,
        background: bool,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            unique_key: unique_key.filter(|key| !key.is_empty()),
            priority,
            background,
            workload: Vec::new(),
            status: TaskStatus::New,
            handle: None,
            known: false,
            running: false,
            numerator: 0,
            denominator: 0,
            result: None,
            exception: None,
            error: None,
            data: Vec::new(),
            warnings: Vec::new(),
            context: None,
        }
    }

    pub fn give_workload(&mut self, workload: impl Into<Vec<u8>>) -> Result<(), ClientError> {
        if self.status != TaskStatus::New {
            return Err(ClientError::TaskAlreadySent {
                function_name: self.function_name.clone(),
            });
        }
        self.workload = workload.into();
        Ok(())
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn unique_key(&self) -> Option<&str> {
        self.unique_key.as_deref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn workload(&self) -> &[u8] {
        &self.workload
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn job_handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    pub fn result(&self) -> Option<&[u8]> {
        self.result.as_deref()
    }

    pub fn exception(&self) -> Option<&[u8]> {
        self.exception.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_known(&self) -> bool {
        self.known
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn numerator(&self) -> u32 {
        self.numerator
    }

    pub fn denominator(&self) -> u32 {
        self.denominator
    }

    /// WORK_DATA chunks in arrival order.
    pub fn data(&self) -> &[Vec<u8>] {
        &self.data
    }

    pub fn warnings(&self) -> &[Vec<u8>] {
        &self.warnings
    }

    /// Background tasks are done once the broker acknowledged them.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal() || (self.background && self.status == TaskStatus::Submitted)
    }

    /// Replaces the attached context; the previous one's cleanup runs now.
    pub fn set_context<T, F>(&mut self, value: T, cleanup: F)
    where
        T: Any + Send,
        F: FnOnce(T) + Send + 'static,
    {
        let cleanup: Cleanup = Box::new(move |boxed: Box<dyn Any + Send>| {
            if let Ok(value) = boxed.downcast::<T>() {
                cleanup(*value);
            }
        });
        self.context = Some(TaskContext {
            value: Some(Box::new(value)),
            cleanup: Some(cleanup),
        });
    }

    pub fn context<T: Any>(&self) -> Option<&T> {
        self.context
            .as_ref()
            .and_then(|context| context.value.as_ref())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn clear_context(&mut self) {
        self.context = None;
    }

    pub(crate) fn submit_packet(&self) -> Result<Packet, PacketError> {
        Packet::request(
            submit_command(self.priority, self.background),
            vec![
                self.function_name.as_bytes().to_vec(),
                self.unique_key.clone().unwrap_or_default().into_bytes(),
                self.workload.clone(),
            ],
        )
    }

    pub(crate) fn mark_created(&mut self, handle: &str) {
        self.handle = Some(handle.to_owned());
        self.status = TaskStatus::Submitted;
        self.known = true;
    }

    pub(crate) fn mark_rejected(&mut self, code: &str, message: &str) {
        self.status = TaskStatus::Rejected;
        self.error = Some(format!("{code}: {message}"));
    }

    /// Applies a relayed WORK_* or STATUS_RES packet addressed to this task's handle.
    pub(crate) fn apply(&mut self, packet: &Packet) -> Result<(), PacketError> {
        if self.status.is_terminal() {
            return Ok(());
        }
        match packet.command {
            Command::WorkStatus => {
                self.numerator = packet.arg_u32(1)?;
                self.denominator = packet.arg_u32(2)?;
                self.running = true;
            }
            Command::WorkData => {
                self.data.push(packet.arg(1)?.to_vec());
                self.running = true;
            }
            Command::WorkWarning => self.warnings.push(packet.arg(1)?.to_vec()),
            Command::WorkComplete => {
                self.result = Some(packet.arg(1)?.to_vec());
                self.finish(TaskStatus::Complete);
            }
            Command::WorkFail => {
                self.error = Some("job failed".to_owned());
                self.finish(TaskStatus::Failed);
            }
            Command::WorkException => {
                self.exception = Some(packet.arg(1)?.to_vec());
                self.finish(TaskStatus::Exception);
            }
            Command::StatusRes => {
                self.known = packet.arg(1)? == b"1";
                self.running = packet.arg(2)? == b"1";
                self.numerator = packet.arg_u32(3)?;
                self.denominator = packet.arg_u32(4)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        self.running = false;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("function_name", &self.function_name)
            .field("unique_key", &self.unique_key)
            .field("priority", &self.priority)
            .field("background", &self.background)
            .field("status", &self.status)
            .field("handle", &self.handle)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

pub fn submit_command(priority: Priority, background: bool) -> Command {
    match (priority, background) {
        (Priority::Normal, false) => Command::SubmitJob,
        (Priority::Normal, true) => Command::SubmitJobBg,
        (Priority::High, false) => Command::SubmitJobHigh,
        (Priority::High, true) => Command::SubmitJobHighBg,
        (Priority::Low, false) => Command::SubmitJobLow,
        (Priority::Low, true) => Command::SubmitJobLowBg,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Tasks owned by one client, addressed by insertion order.
#[derive(Debug, Default)]
pub struct TaskList {
    tasks: Vec<Task>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: Task) -> TaskId {
        self.tasks.push(task);
        TaskId(self.tasks.len() - 1)
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id.0)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaskId, &Task)> {
        self.tasks
            .iter()
            .enumerate()
            .map(|(index, task)| (TaskId(index), task))
    }

    pub fn unsent(&self) -> Vec<TaskId> {
        self.iter()
            .filter(|(_, task)| task.status() == TaskStatus::New)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn all_finished(&self) -> bool {
        self.tasks.iter().all(Task::is_finished)
    }

    /// Routes an update to every task sharing the handle; coalesced submissions share one.
    pub(crate) fn apply(&mut self, handle: &str, packet: &Packet) -> Result<usize, PacketError> {
        let mut applied = 0;
        for task in self
            .tasks
            .iter_mut()
            .filter(|task| task.job_handle() == Some(handle))
        {
            task.apply(packet)?;
            applied += 1;
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::client::ClientError;
    use crate::orchestrator::jobs::Priority;
    use crate::wire::packet::{Command, Packet};

    use super::{submit_command, Task, TaskList, TaskStatus};

    fn counting_cleanup(counter: &Arc<AtomicUsize>) -> impl FnOnce(String) + Send + 'static {
        let counter = Arc::clone(counter);
        move |_value: String| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn context_cleanup_runs_once_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let mut task = Task::new("reverse", None, Priority::Normal, false);
            task.set_context("ctx".to_owned(), counting_cleanup(&counter));
            assert_eq!(task.context::<String>().map(String::as_str), Some("ctx"));
            assert!(task.context::<u32>().is_none());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replacing_context_cleans_up_the_previous_value() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut task = Task::new("reverse", None, Priority::Normal, false);

        task.set_context("one".to_owned(), counting_cleanup(&first));
        task.set_context("two".to_owned(), counting_cleanup(&second));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        drop(task);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn workload_is_frozen_once_sent() {
        let mut task = Task::new("reverse", Some(String::new()), Priority::High, true);
        assert_eq!(task.unique_key(), None);
        task.give_workload(b"abc".to_vec()).expect("workload before submit");

        let packet = task.submit_packet().expect("submit packet");
        assert_eq!(packet.command, Command::SubmitJobHighBg);
        assert_eq!(packet.args, vec![b"reverse".to_vec(), Vec::new(), b"abc".to_vec()]);

        task.mark_created("H:n:1");
        assert!(matches!(
            task.give_workload(b"late".to_vec()),
            Err(ClientError::TaskAlreadySent { .. })
        ));
        assert_eq!(task.workload(), b"abc");
        assert!(task.is_finished(), "background tasks finish at creation");
    }

    #[test]
    fn updates_track_progress_and_outcome() {
        let mut task = Task::new("reverse", Some("u".to_owned()), Priority::Normal, false);
        task.mark_created("H:n:7");
        assert!(task.is_known());

        let status = Packet::response(
            Command::WorkStatus,
            vec![b"H:n:7".to_vec(), b"1".to_vec(), b"4".to_vec()],
        )
        .expect("status packet");
        task.apply(&status).expect("status");
        task.apply(&Packet::work_update(Command::WorkData, "H:n:7", b"part"))
            .expect("data");
        assert!(task.is_running());
        assert_eq!((task.numerator(), task.denominator()), (1, 4));
        assert_eq!(task.data(), &[b"part".to_vec()]);

        task.apply(&Packet::work_update(Command::WorkComplete, "H:n:7", b"cba"))
            .expect("complete");
        assert_eq!(task.status(), TaskStatus::Complete);
        assert_eq!(task.result(), Some(b"cba".as_slice()));
        assert!(!task.is_running());

        task.apply(&Packet::work_fail("H:n:7")).expect("ignored");
        assert_eq!(task.status(), TaskStatus::Complete);
        assert!(task.error().is_none());
    }

    #[test]
    fn exception_and_failure_are_reported() {
        let mut failing = Task::new("f", None, Priority::Low, false);
        failing.mark_created("H:n:1");
        failing.apply(&Packet::work_fail("H:n:1")).expect("fail");
        assert_eq!(failing.status(), TaskStatus::Failed);
        assert!(failing.error().is_some());

        let mut throwing = Task::new("f", None, Priority::Low, false);
        throwing.mark_created("H:n:2");
        throwing
            .apply(&Packet::work_update(Command::WorkException, "H:n:2", b"boom"))
            .expect("exception");
        assert_eq!(throwing.exception(), Some(b"boom".as_slice()));
        assert_eq!(throwing.status(), TaskStatus::Exception);
    }

    #[test]
    fn task_list_routes_updates_to_coalesced_tasks() {
        let mut list = TaskList::new();
        let first = list.add(Task::new("reverse", Some("abc".to_owned()), Priority::Normal, false));
        let second = list.add(Task::new("reverse", Some("abc".to_owned()), Priority::Normal, false));
        let other = list.add(Task::new("upper", None, Priority::Normal, false));
        assert_eq!(list.unsent(), vec![first, second, other]);

        for id in [first, second] {
            list.get_mut(id).expect("task").mark_created("H:n:1");
        }
        list.get_mut(other).expect("task").mark_created("H:n:2");

        let applied = list
            .apply("H:n:1", &Packet::work_update(Command::WorkComplete, "H:n:1", b"cba"))
            .expect("apply");
        assert_eq!(applied, 2);
        assert!(!list.all_finished());
        assert_eq!(list.get(second).and_then(Task::result), Some(b"cba".as_slice()));
        assert_eq!(list.get(other).map(Task::status), Some(TaskStatus::Submitted));
    }

    #[test]
    fn submit_command_covers_every_priority() {
        assert_eq!(submit_command(Priority::Normal, false), Command::SubmitJob);
        assert_eq!(submit_command(Priority::Low, true), Command::SubmitJobLowBg);
        assert_eq!(submit_command(Priority::High, false), Command::SubmitJobHigh);
    }
}
