use std::fmt;

pub const REQUEST_MAGIC: [u8; 4] = *b"\0REQ";
pub const RESPONSE_MAGIC: [u8; 4] = *b"\0RES";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    pub fn from_bytes(raw: [u8; 4]) -> Option<Self> {
        match raw {
            REQUEST_MAGIC => Some(Self::Request),
            RESPONSE_MAGIC => Some(Self::Response),
            _ => None,
        }
    }

    pub fn as_bytes(self) -> [u8; 4] {
        match self {
            Self::Request => REQUEST_MAGIC,
            Self::Response => RESPONSE_MAGIC,
        }
    }
}

/// Which side of the conversation may legitimately send a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
    Both,
}

macro_rules! commands {
    ($( $variant:ident = $code:literal, $name:literal, $arity:literal, $direction:ident; )*) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Command {
            $( $variant, )*
        }

        impl Command {
            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $( $code => Some(Self::$variant), )*
                    _ => None,
                }
            }

            pub fn code(self) -> u32 {
                match self {
                    $( Self::$variant => $code, )*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $name, )*
                }
            }

            /// Number of arguments carried in the body; the last one is length-implied.
            pub fn arity(self) -> usize {
                match self {
                    $( Self::$variant => $arity, )*
                }
            }

            pub fn direction(self) -> Direction {
                match self {
                    $( Self::$variant => Direction::$direction, )*
                }
            }
        }
    };
}

commands! {
    CanDo = 1, "CAN_DO", 1, Request;
    CantDo = 2, "CANT_DO", 1, Request;
    ResetAbilities = 3, "RESET_ABILITIES", 0, Request;
    PreSleep = 4, "PRE_SLEEP", 0, Request;
    Noop = 6, "NOOP", 0, Response;
    SubmitJob = 7, "SUBMIT_JOB", 3, Request;
    JobCreated = 8, "JOB_CREATED", 1, Response;
    GrabJob = 9, "GRAB_JOB", 0, Request;
    NoJob = 10, "NO_JOB", 0, Response;
    JobAssign = 11, "JOB_ASSIGN", 3, Response;
    WorkStatus = 12, "WORK_STATUS", 3, Both;
    WorkComplete = 13, "WORK_COMPLETE", 2, Both;
    WorkFail = 14, "WORK_FAIL", 1, Both;
    GetStatus = 15, "GET_STATUS", 1, Request;
    EchoReq = 16, "ECHO_REQ", 1, Request;
    EchoRes = 17, "ECHO_RES", 1, Response;
    SubmitJobBg = 18, "SUBMIT_JOB_BG", 3, Request;
    Error = 19, "ERROR", 2, Response;
    StatusRes = 20, "STATUS_RES", 5, Response;
    SubmitJobHigh = 21, "SUBMIT_JOB_HIGH", 3, Request;
    SetClientId = 22, "SET_CLIENT_ID", 1, Request;
    WorkException = 25, "WORK_EXCEPTION", 2, Both;
    WorkData = 28, "WORK_DATA", 2, Both;
    WorkWarning = 29, "WORK_WARNING", 2, Both;
    GrabJobUniq = 30, "GRAB_JOB_UNIQ", 0, Request;
    JobAssignUniq = 31, "JOB_ASSIGN_UNIQ", 4, Response;
    SubmitJobHighBg = 32, "SUBMIT_JOB_HIGH_BG", 3, Request;
    SubmitJobLow = 33, "SUBMIT_JOB_LOW", 3, Request;
    SubmitJobLowBg = 34, "SUBMIT_JOB_LOW_BG", 3, Request;
}

impl Command {
    pub fn accepts(self, magic: Magic) -> bool {
        match (self.direction(), magic) {
            (Direction::Both, _) => true,
            (Direction::Request, Magic::Request) => true,
            (Direction::Response, Magic::Response) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PacketError {
    ArityMismatch {
        command: Command,
        expected: usize,
        actual: usize,
    },
    MissingArgument {
        command: Command,
        index: usize,
    },
    ArgumentNotUtf8 {
        command: Command,
        index: usize,
    },
    ArgumentNotNumeric {
        command: Command,
        index: usize,
    },
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArityMismatch {
                command,
                expected,
                actual,
            } => write!(f, "{command} takes {expected} arguments, got {actual}"),
            Self::MissingArgument { command, index } => {
                write!(f, "{command} is missing argument #{index}")
            }
            Self::ArgumentNotUtf8 { command, index } => {
                write!(f, "{command} argument #{index} must be valid UTF-8")
            }
            Self::ArgumentNotNumeric { command, index } => {
                write!(f, "{command} argument #{index} must be an unsigned decimal integer")
            }
        }
    }
}

impl std::error::Error for PacketError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub magic: Magic,
    pub command: Command,
    pub args: Vec<Vec<u8>>,
}

impl Packet {
    pub fn new(magic: Magic, command: Command, args: Vec<Vec<u8>>) -> Result<Self, PacketError> {
        if args.len() != command.arity() {
            return Err(PacketError::ArityMismatch {
                command,
                expected: command.arity(),
                actual: args.len(),
            });
        }

        Ok(Self {
            magic,
            command,
            args,
        })
    }

    pub fn request(command: Command, args: Vec<Vec<u8>>) -> Result<Self, PacketError> {
        Self::new(Magic::Request, command, args)
    }

    pub fn response(command: Command, args: Vec<Vec<u8>>) -> Result<Self, PacketError> {
        Self::new(Magic::Response, command, args)
    }

    // Zero-arity and fixed-shape responses the broker emits; arity holds by construction.
    pub fn noop() -> Self {
        Self::bare(Magic::Response, Command::Noop, Vec::new())
    }

    pub fn no_job() -> Self {
        Self::bare(Magic::Response, Command::NoJob, Vec::new())
    }

    pub fn job_created(handle: &str) -> Self {
        Self::bare(
            Magic::Response,
            Command::JobCreated,
            vec![handle.as_bytes().to_vec()],
        )
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::bare(
            Magic::Response,
            Command::Error,
            vec![code.as_bytes().to_vec(), message.as_bytes().to_vec()],
        )
    }

    pub fn echo_res(data: &[u8]) -> Self {
        Self::bare(Magic::Response, Command::EchoRes, vec![data.to_vec()])
    }

    pub fn job_assign(handle: &str, function_name: &str, payload: &[u8]) -> Self {
        Self::bare(
            Magic::Response,
            Command::JobAssign,
            vec![
                handle.as_bytes().to_vec(),
                function_name.as_bytes().to_vec(),
                payload.to_vec(),
            ],
        )
    }

    pub fn job_assign_uniq(handle: &str, function_name: &str, unique: &str, payload: &[u8]) -> Self {
        Self::bare(
            Magic::Response,
            Command::JobAssignUniq,
            vec![
                handle.as_bytes().to_vec(),
                function_name.as_bytes().to_vec(),
                unique.as_bytes().to_vec(),
                payload.to_vec(),
            ],
        )
    }

    pub fn status_res(handle: &str, known: bool, running: bool, numerator: u32, denominator: u32) -> Self {
        let flag = |value: bool| if value { b"1".to_vec() } else { b"0".to_vec() };
        Self::bare(
            Magic::Response,
            Command::StatusRes,
            vec![
                handle.as_bytes().to_vec(),
                flag(known),
                flag(running),
                numerator.to_string().into_bytes(),
                denominator.to_string().into_bytes(),
            ],
        )
    }

    pub fn work_fail(handle: &str) -> Self {
        Self::bare(Magic::Response, Command::WorkFail, vec![handle.as_bytes().to_vec()])
    }

    /// WORK_DATA, WORK_WARNING, WORK_COMPLETE and WORK_EXCEPTION all carry `handle, data`.
    pub fn work_update(command: Command, handle: &str, data: &[u8]) -> Self {
        Self::bare(
            Magic::Response,
            command,
            vec![handle.as_bytes().to_vec(), data.to_vec()],
        )
    }

    fn bare(magic: Magic, command: Command, args: Vec<Vec<u8>>) -> Self {
        debug_assert_eq!(args.len(), command.arity());
        Self {
            magic,
            command,
            args,
        }
    }

    /// Re-stamps a worker-originated packet as a response without touching its arguments.
    pub fn relayed(&self) -> Self {
        Self {
            magic: Magic::Response,
            command: self.command,
            args: self.args.clone(),
        }
    }

    pub fn arg(&self, index: usize) -> Result<&[u8], PacketError> {
        self.args
            .get(index)
            .map(Vec::as_slice)
            .ok_or(PacketError::MissingArgument {
                command: self.command,
                index,
            })
    }

    pub fn arg_str(&self, index: usize) -> Result<&str, PacketError> {
        std::str::from_utf8(self.arg(index)?).map_err(|_| PacketError::ArgumentNotUtf8 {
            command: self.command,
            index,
        })
    }

    pub fn arg_u32(&self, index: usize) -> Result<u32, PacketError> {
        let raw = self.arg_str(index)?;
        if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(PacketError::ArgumentNotNumeric {
                command: self.command,
                index,
            });
        }
        raw.parse::<u32>()
            .map_err(|_| PacketError::ArgumentNotNumeric {
                command: self.command,
                index,
            })
    }

    pub fn body_len(&self) -> usize {
        let separators = self.args.len().saturating_sub(1);
        self.args.iter().map(Vec::len).sum::<usize>() + separators
    }
}
