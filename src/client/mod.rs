//! Blocking client that submits tasks to a broker and collects their outcomes.

pub mod task;

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::wire::codec::{CodecError, WireCodec};
use crate::wire::connection::FrameBuffer;
use crate::wire::packet::{Command, Packet, PacketError};

pub use task::{Task, TaskId, TaskList, TaskStatus};

const READ_CHUNK_BYTES: usize = 16 * 1024;
const READ_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum ClientError {
    Connect { address: String, source: io::Error },
    Io(io::Error),
    Codec(CodecError),
    Packet(PacketError),
    TaskAlreadySent { function_name: String },
    UnknownTask { id: TaskId },
    Rejected { code: String, message: String },
    Timeout { waited: Duration },
    Closed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { address, source } => {
                write!(f, "failed to connect to broker at {address}: {source}")
            }
            Self::Io(source) => write!(f, "broker connection I/O error: {source}"),
            Self::Codec(source) => write!(f, "broker packet framing error: {source}"),
            Self::Packet(source) => write!(f, "malformed broker packet: {source}"),
            Self::TaskAlreadySent { function_name } => {
                write!(f, "task for '{function_name}' was already sent; its workload is frozen")
            }
            Self::UnknownTask { id } => write!(f, "{id} does not belong to this client"),
            Self::Rejected { code, message } => write!(f, "broker rejected request: {code}: {message}"),
            Self::Timeout { waited } => {
                write!(f, "no broker response within {}ms", waited.as_millis())
            }
            Self::Closed => write!(f, "broker closed the connection"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(source: io::Error) -> Self {
        Self::Io(source)
    }
}

impl From<PacketError> for ClientError {
    fn from(source: PacketError) -> Self {
        Self::Packet(source)
    }
}

/// Answer to a GET_STATUS query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobStatus {
    pub handle: String,
    pub known: bool,
    pub running: bool,
    pub numerator: u32,
    pub denominator: u32,
}

pub struct Client {
    stream: TcpStream,
    codec: WireCodec,
    frames: FrameBuffer,
    tasks: TaskList,
    timeout: Duration,
}

impl Client {
    pub fn connect(address: impl ToSocketAddrs + fmt::Debug, codec: WireCodec) -> Result<Self, ClientError> {
        let label = format!("{address:?}");
        let stream = TcpStream::connect(address).map_err(|source| ClientError::Connect {
            address: label.clone(),
            source,
        })?;
        stream
            .set_read_timeout(Some(READ_POLL))
            .and_then(|()| stream.set_nodelay(true))
            .map_err(|source| ClientError::Connect {
                address: label,
                source,
            })?;

        Ok(Self {
            stream,
            codec,
            frames: FrameBuffer::new(),
            tasks: TaskList::new(),
            timeout: Duration::from_secs(30),
        })
    }

    /// How long any single wait for broker packets may take.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn add_task(&mut self, task: Task) -> TaskId {
        self.tasks.add(task)
    }

    pub fn tasks(&self) -> &TaskList {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Sends one task and waits for its JOB_CREATED. A broker ERROR marks the task rejected.
    pub fn submit(&mut self, id: TaskId) -> Result<(), ClientError> {
        let task = self.tasks.get(id).ok_or(ClientError::UnknownTask { id })?;
        if task.status() != TaskStatus::New {
            return Err(ClientError::TaskAlreadySent {
                function_name: task.function_name().to_owned(),
            });
        }
        let packet = task.submit_packet()?;
        self.write_packet(&packet)?;

        let reply = self.wait_for(|packet| {
            matches!(packet.command, Command::JobCreated | Command::Error)
        })?;
        let task = self.tasks.get_mut(id).ok_or(ClientError::UnknownTask { id })?;
        match reply.command {
            Command::JobCreated => task.mark_created(reply.arg_str(0)?),
            _ => task.mark_rejected(reply.arg_str(0)?, reply.arg_str(1)?),
        }
        Ok(())
    }

    /// Submits every unsent task, then reads until each one has finished.
    pub fn run_until_finished(&mut self) -> Result<(), ClientError> {
        for id in self.tasks.unsent() {
            self.submit(id)?;
        }
        let deadline = Instant::now() + self.timeout;
        while !self.tasks.all_finished() {
            let packet = self.read_packet(deadline)?;
            self.route(&packet)?;
        }
        Ok(())
    }

    pub fn get_status(&mut self, handle: &str) -> Result<JobStatus, ClientError> {
        let packet = Packet::request(Command::GetStatus, vec![handle.as_bytes().to_vec()])?;
        self.write_packet(&packet)?;
        let reply = self.wait_for(|packet| {
            packet.command == Command::Error
                || (packet.command == Command::StatusRes
                    && packet.arg(0).is_ok_and(|raw| raw == handle.as_bytes()))
        })?;
        if reply.command == Command::Error {
            return Err(rejection(&reply)?);
        }

        self.tasks.apply(handle, &reply)?;
        Ok(JobStatus {
            handle: handle.to_owned(),
            known: reply.arg(1)? == b"1",
            running: reply.arg(2)? == b"1",
            numerator: reply.arg_u32(3)?,
            denominator: reply.arg_u32(4)?,
        })
    }

    pub fn echo(&mut self, data: &[u8]) -> Result<Vec<u8>, ClientError> {
        let packet = Packet::request(Command::EchoReq, vec![data.to_vec()])?;
        self.write_packet(&packet)?;
        let reply = self.wait_for(|packet| matches!(packet.command, Command::EchoRes | Command::Error))?;
        if reply.command == Command::Error {
            return Err(rejection(&reply)?);
        }
        Ok(reply.arg(0)?.to_vec())
    }

    /// The broker sends no reply to SET_CLIENT_ID.
    pub fn set_client_id(&mut self, client_id: &str) -> Result<(), ClientError> {
        let packet = Packet::request(Command::SetClientId, vec![client_id.as_bytes().to_vec()])?;
        self.write_packet(&packet)
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let bytes = self.codec.encode(packet).map_err(ClientError::Codec)?;
        self.stream.write_all(&bytes)?;
        Ok(())
    }

    /// Reads until `wanted` matches, routing task updates that arrive in between.
    fn wait_for(&mut self, wanted: impl Fn(&Packet) -> bool) -> Result<Packet, ClientError> {
        let deadline = Instant::now() + self.timeout;
        let mut deferred = VecDeque::new();
        loop {
            let packet = self.read_packet(deadline)?;
            if wanted(&packet) {
                for pending in deferred.drain(..) {
                    self.route(&pending)?;
                }
                return Ok(packet);
            }
            deferred.push_back(packet);
        }
    }

    fn route(&mut self, packet: &Packet) -> Result<(), ClientError> {
        match packet.command {
            Command::WorkStatus
            | Command::WorkData
            | Command::WorkWarning
            | Command::WorkComplete
            | Command::WorkFail
            | Command::WorkException
            | Command::StatusRes => {
                let handle = packet.arg_str(0)?.to_owned();
                self.tasks.apply(&handle, packet)?;
                Ok(())
            }
            Command::Error => Err(rejection(packet)?),
            _ => Ok(()),
        }
    }

    fn read_packet(&mut self, deadline: Instant) -> Result<Packet, ClientError> {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            if let Some(packet) = self
                .frames
                .next_packet(&self.codec)
                .map_err(ClientError::Codec)?
            {
                return Ok(packet);
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout {
                    waited: self.timeout,
                });
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(ClientError::Closed),
                Ok(read) => self.frames.extend(&chunk[..read]),
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(error) => return Err(ClientError::Io(error)),
            }
        }
    }
}

fn rejection(packet: &Packet) -> Result<ClientError, ClientError> {
    Ok(ClientError::Rejected {
        code: packet.arg_str(0)?.to_owned(),
        message: packet.arg_str(1)?.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use crate::orchestrator::jobs::Priority;
    use crate::wire::codec::WireCodec;
    use crate::wire::connection::FrameBuffer;
    use crate::wire::packet::{Command, Packet};

    use super::{Client, ClientError, Task, TaskStatus};

    /// Accepts one connection, answers each expected request command with canned packets.
    fn scripted_broker(script: Vec<(Command, Vec<Packet>)>) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let address = listener.local_addr().expect("local addr").to_string();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let codec = WireCodec::default();
            let mut frames = FrameBuffer::new();
            let mut chunk = [0_u8; 1024];
            for (expected, replies) in script {
                let request = loop {
                    if let Some(packet) = frames.next_packet(&codec).expect("decode") {
                        break packet;
                    }
                    let read = stream.read(&mut chunk).expect("read");
                    assert!(read > 0, "client hung up early");
                    frames.extend(&chunk[..read]);
                };
                assert_eq!(request.command, expected);
                for reply in replies {
                    let bytes = codec.encode(&reply).expect("encode");
                    stream.write_all(&bytes).expect("write");
                }
            }
        });
        (address, handle)
    }

    fn client(address: &str) -> Client {
        let mut client = Client::connect(address, WireCodec::default()).expect("connect");
        client.set_timeout(Duration::from_secs(5));
        client
    }

    #[test]
    fn submit_then_run_collects_progress_and_result() {
        let (address, broker) = scripted_broker(vec![(
            Command::SubmitJob,
            vec![
                Packet::job_created("H:t:1"),
                Packet::response(
                    Command::WorkStatus,
                    vec![b"H:t:1".to_vec(), b"1".to_vec(), b"2".to_vec()],
                )
                .expect("status packet"),
                Packet::work_update(Command::WorkComplete, "H:t:1", b"cba"),
            ],
        )]);
        let mut client = client(&address);
        let mut task = Task::new("reverse", None, Priority::Normal, false);
        task.give_workload(b"abc".to_vec()).expect("workload");
        let id = client.add_task(task);

        client.run_until_finished().expect("run");
        let task = client.task(id).expect("task");
        assert_eq!(task.job_handle(), Some("H:t:1"));
        assert_eq!(task.status(), TaskStatus::Complete);
        assert_eq!(task.result(), Some(b"cba".as_slice()));
        assert_eq!((task.numerator(), task.denominator()), (1, 2));
        broker.join().expect("broker thread");
    }

    #[test]
    fn rejected_submission_marks_the_task() {
        let (address, broker) = scripted_broker(vec![(
            Command::SubmitJobLow,
            vec![Packet::error("ERR_INVALID_FUNCTION", "function name is empty")],
        )]);
        let mut client = client(&address);
        let id = client.add_task(Task::new("", None, Priority::Low, false));

        client.run_until_finished().expect("run");
        let task = client.task(id).expect("task");
        assert_eq!(task.status(), TaskStatus::Rejected);
        assert!(task.error().is_some_and(|error| error.starts_with("ERR_INVALID_FUNCTION")));
        assert!(matches!(
            client.submit(id),
            Err(ClientError::TaskAlreadySent { .. })
        ));
        broker.join().expect("broker thread");
    }

    #[test]
    fn status_and_echo_round_trip() {
        let (address, broker) = scripted_broker(vec![
            (Command::SetClientId, Vec::new()),
            (Command::EchoReq, vec![Packet::echo_res(b"ping")]),
            (
                Command::GetStatus,
                vec![Packet::status_res("H:t:9", true, true, 3, 4)],
            ),
        ]);
        let mut client = client(&address);

        client.set_client_id("tester").expect("client id");
        assert_eq!(client.echo(b"ping").expect("echo"), b"ping".to_vec());
        let status = client.get_status("H:t:9").expect("status");
        assert!(status.known && status.running);
        assert_eq!((status.numerator, status.denominator), (3, 4));
        broker.join().expect("broker thread");
    }
}
