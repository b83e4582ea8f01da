use std::fmt;

use crate::orchestrator::jobs::{Priority, Progress};
use crate::wire::connection::Role;
use crate::wire::packet::{Command, Direction, Magic, Packet, PacketError};

pub mod runtime;

pub const PROTOCOL_ERROR_CODE: &str = "ERR_PROTOCOL";
pub const UNEXPECTED_COMMAND_CODE: &str = "ERR_UNEXPECTED_COMMAND";
pub const INVALID_FUNCTION_CODE: &str = "ERR_INVALID_FUNCTION";
pub const UNKNOWN_JOB_CODE: &str = "ERR_UNKNOWN_JOB";
pub const NOT_ASSIGNED_CODE: &str = "ERR_NOT_ASSIGNED";
pub const JOB_FINISHED_CODE: &str = "ERR_JOB_FINISHED";
pub const ROLE_MISMATCH_CODE: &str = "ERR_ROLE_MISMATCH";
pub const QUEUE_STORE_CODE: &str = "ERR_QUEUE_STORE";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub function_name: String,
    pub unique_key: Option<String>,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub background: bool,
}

/// Intermediate update kinds that are relayed to observers without changing job state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkNotice {
    Data,
    Warning,
}

impl WorkNotice {
    pub fn command(self) -> Command {
        match self {
            Self::Data => Command::WorkData,
            Self::Warning => Command::WorkWarning,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    CanDo { function_name: String },
    CantDo { function_name: String },
    ResetAbilities,
    PreSleep,
    Submit(Submission),
    GrabJob { include_unique: bool },
    /// `relay` is the worker's packet re-stamped as a response, forwarded to observers as sent.
    WorkStatus { handle: String, progress: Progress, relay: Packet },
    WorkNotice { kind: WorkNotice, handle: String, data: Vec<u8> },
    WorkComplete { handle: String, result: Vec<u8> },
    WorkFail { handle: String },
    WorkException { handle: String, data: Vec<u8> },
    GetStatus { handle: String },
    Echo { data: Vec<u8> },
    SetClientId { client_id: String },
}

impl Request {
    /// Role a connection takes on by sending this request; `None` for role-neutral commands.
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Submit(_) => Some(Role::Client),
            Self::GetStatus { .. } | Self::Echo { .. } | Self::SetClientId { .. } => None,
            _ => Some(Role::Worker),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SessionError {
    ResponseMagic { command: Command },
    UnexpectedCommand { command: Command },
    Malformed(PacketError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ResponseMagic { .. } | Self::Malformed(_) => PROTOCOL_ERROR_CODE,
            Self::UnexpectedCommand { .. } => UNEXPECTED_COMMAND_CODE,
        }
    }

    /// Response magic from a peer means it is not speaking the request side of the protocol.
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::ResponseMagic { .. })
    }

    pub fn to_packet(&self) -> Packet {
        Packet::error(self.code(), &self.to_string())
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResponseMagic { command } => {
                write!(f, "{command} was sent with response magic")
            }
            Self::UnexpectedCommand { command } => {
                write!(f, "{command} is a server response and cannot be sent to the broker")
            }
            Self::Malformed(source) => write!(f, "malformed packet: {source}"),
        }
    }
}

impl std::error::Error for SessionError {}

pub fn interpret(packet: &Packet) -> Result<Request, SessionError> {
    let command = packet.command;
    match (packet.magic, command.direction()) {
        (Magic::Response, Direction::Request | Direction::Response) => {
            return Err(SessionError::ResponseMagic { command });
        }
        (Magic::Request, Direction::Response) => {
            return Err(SessionError::UnexpectedCommand { command });
        }
        _ => {}
    }

    let request = match command {
        Command::CanDo => Request::CanDo {
            function_name: packet.arg_str(0)?.to_owned(),
        },
        Command::CantDo => Request::CantDo {
            function_name: packet.arg_str(0)?.to_owned(),
        },
        Command::ResetAbilities => Request::ResetAbilities,
        Command::PreSleep => Request::PreSleep,
        Command::SubmitJob => submission(packet, Priority::Normal, false)?,
        Command::SubmitJobBg => submission(packet, Priority::Normal, true)?,
        Command::SubmitJobHigh => submission(packet, Priority::High, false)?,
        Command::SubmitJobHighBg => submission(packet, Priority::High, true)?,
        Command::SubmitJobLow => submission(packet, Priority::Low, false)?,
        Command::SubmitJobLowBg => submission(packet, Priority::Low, true)?,
        Command::GrabJob => Request::GrabJob {
            include_unique: false,
        },
        Command::GrabJobUniq => Request::GrabJob {
            include_unique: true,
        },
        Command::WorkStatus => Request::WorkStatus {
            handle: packet.arg_str(0)?.to_owned(),
            progress: Progress {
                numerator: packet.arg_u32(1)?,
                denominator: packet.arg_u32(2)?,
            },
            relay: packet.relayed(),
        },
        Command::WorkData => work_notice(packet, WorkNotice::Data)?,
        Command::WorkWarning => work_notice(packet, WorkNotice::Warning)?,
        Command::WorkComplete => Request::WorkComplete {
            handle: packet.arg_str(0)?.to_owned(),
            result: packet.arg(1)?.to_vec(),
        },
        Command::WorkFail => Request::WorkFail {
            handle: packet.arg_str(0)?.to_owned(),
        },
        Command::WorkException => Request::WorkException {
            handle: packet.arg_str(0)?.to_owned(),
            data: packet.arg(1)?.to_vec(),
        },
        Command::GetStatus => Request::GetStatus {
            handle: packet.arg_str(0)?.to_owned(),
        },
        Command::EchoReq => Request::Echo {
            data: packet.arg(0)?.to_vec(),
        },
        Command::SetClientId => Request::SetClientId {
            client_id: packet.arg_str(0)?.to_owned(),
        },
        Command::Noop
        | Command::JobCreated
        | Command::NoJob
        | Command::JobAssign
        | Command::JobAssignUniq
        | Command::EchoRes
        | Command::Error
        | Command::StatusRes => return Err(SessionError::UnexpectedCommand { command }),
    };

    Ok(request)
}

impl From<PacketError> for SessionError {
    fn from(source: PacketError) -> Self {
        Self::Malformed(source)
    }
}

fn submission(packet: &Packet, priority: Priority, background: bool) -> Result<Request, SessionError> {
    let unique = packet.arg_str(1)?;
    Ok(Request::Submit(Submission {
        function_name: packet.arg_str(0)?.to_owned(),
        unique_key: (!unique.is_empty()).then(|| unique.to_owned()),
        payload: packet.arg(2)?.to_vec(),
        priority,
        background,
    }))
}

fn work_notice(packet: &Packet, kind: WorkNotice) -> Result<Request, SessionError> {
    Ok(Request::WorkNotice {
        kind,
        handle: packet.arg_str(0)?.to_owned(),
        data: packet.arg(1)?.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::{
        interpret, Request, SessionError, Submission, WorkNotice, PROTOCOL_ERROR_CODE,
        UNEXPECTED_COMMAND_CODE,
    };
    use crate::orchestrator::jobs::{Priority, Progress};
    use crate::wire::connection::Role;
    use crate::wire::packet::{Command, Magic, Packet, PacketError};

    fn request(command: Command, args: &[&[u8]]) -> Packet {
        Packet::request(command, args.iter().map(|arg| arg.to_vec()).collect())
            .expect("test packet should build")
    }

    #[test]
    fn submit_variants_carry_priority_and_background() {
        let packet = request(Command::SubmitJobHighBg, &[b"reverse", b"", b"abc"]);
        assert_eq!(
            interpret(&packet),
            Ok(Request::Submit(Submission {
                function_name: "reverse".to_owned(),
                unique_key: None,
                payload: b"abc".to_vec(),
                priority: Priority::High,
                background: true,
            }))
        );

        let packet = request(Command::SubmitJobLow, &[b"reverse", b"u-1", b""]);
        let Ok(Request::Submit(submission)) = interpret(&packet) else {
            panic!("low submit should interpret");
        };
        assert_eq!(submission.priority, Priority::Low);
        assert_eq!(submission.unique_key.as_deref(), Some("u-1"));
        assert!(!submission.background);
    }

    #[test]
    fn worker_updates_parse_handles_and_progress() {
        let packet = request(Command::WorkStatus, &[b"H:n:1", b"3", b"10"]);
        assert_eq!(
            interpret(&packet),
            Ok(Request::WorkStatus {
                handle: "H:n:1".to_owned(),
                progress: Progress {
                    numerator: 3,
                    denominator: 10
                },
                relay: Packet::new(
                    Magic::Response,
                    Command::WorkStatus,
                    vec![b"H:n:1".to_vec(), b"3".to_vec(), b"10".to_vec()],
                )
                .expect("relay packet"),
            })
        );

        let packet = request(Command::WorkWarning, &[b"H:n:1", b"careful"]);
        assert!(matches!(
            interpret(&packet),
            Ok(Request::WorkNotice {
                kind: WorkNotice::Warning,
                ..
            })
        ));
    }

    #[test]
    fn non_numeric_progress_is_malformed_but_not_fatal() {
        let packet = request(Command::WorkStatus, &[b"H:n:1", b"half", b"10"]);
        let err = interpret(&packet).expect_err("progress must be numeric");
        assert!(matches!(
            err,
            SessionError::Malformed(PacketError::ArgumentNotNumeric { index: 1, .. })
        ));
        assert_eq!(err.code(), PROTOCOL_ERROR_CODE);
        assert!(!err.closes_connection());
    }

    #[test]
    fn response_only_commands_are_unexpected() {
        let packet = request(Command::NoJob, &[]);
        let err = interpret(&packet).expect_err("NO_JOB is response-only");
        assert_eq!(err.code(), UNEXPECTED_COMMAND_CODE);
        assert!(!err.closes_connection());
    }

    #[test]
    fn response_magic_closes_the_connection() {
        let packet = Packet::new(Magic::Response, Command::GrabJob, Vec::new())
            .expect("packet should build");
        let err = interpret(&packet).expect_err("response magic is rejected");
        assert!(err.closes_connection());
        assert_eq!(err.to_packet().command, Command::Error);

        // WORK_* may legitimately travel with either magic.
        let packet = Packet::new(
            Magic::Response,
            Command::WorkFail,
            vec![b"H:n:1".to_vec()],
        )
        .expect("packet should build");
        assert!(interpret(&packet).is_ok());
    }

    #[test]
    fn roles_follow_command_family() {
        let submit = interpret(&request(Command::SubmitJob, &[b"f", b"", b"x"])).expect("submit");
        let grab = interpret(&request(Command::GrabJobUniq, &[])).expect("grab");
        let echo = interpret(&request(Command::EchoReq, &[b"ping"])).expect("echo");
        assert_eq!(submit.role(), Some(Role::Client));
        assert_eq!(grab.role(), Some(Role::Worker));
        assert_eq!(echo.role(), None);
    }
}
