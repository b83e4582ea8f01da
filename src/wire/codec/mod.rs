use std::fmt;

use crate::config::AppConfig;
use crate::wire::packet::{Command, Magic, Packet};

pub const HEADER_SIZE_BYTES: usize = 12;
pub const DEFAULT_MAX_PACKET_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const ARGUMENT_SEPARATOR: u8 = 0;

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    InvalidMagic { raw: [u8; 4] },
    UnknownCommand { code: u32 },
    BodyTooLarge { size: usize, limit: usize },
    MissingSeparator { command: Command, expected: usize, found: usize },
    UnexpectedBody { command: Command, size: usize },
    SeparatorInArgument { command: Command, index: usize },
    ArityMismatch { command: Command, expected: usize, actual: usize },
    InvalidMaxPacketSize { value: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic { raw } => write!(f, "invalid packet magic {raw:02x?}"),
            Self::UnknownCommand { code } => write!(f, "unknown command code {code}"),
            Self::BodyTooLarge { size, limit } => {
                write!(f, "packet body of {size} bytes exceeds limit {limit}")
            }
            Self::MissingSeparator {
                command,
                expected,
                found,
            } => write!(
                f,
                "{command} body carries {found} argument separators, expected {expected}"
            ),
            Self::UnexpectedBody { command, size } => {
                write!(f, "{command} takes no arguments but body has {size} bytes")
            }
            Self::SeparatorInArgument { command, index } => write!(
                f,
                "{command} argument #{index} contains the reserved separator byte"
            ),
            Self::ArityMismatch {
                command,
                expected,
                actual,
            } => write!(f, "{command} takes {expected} arguments, got {actual}"),
            Self::InvalidMaxPacketSize { value } => {
                write!(f, "max packet size must be at least 1 byte, got {value}")
            }
        }
    }
}

impl std::error::Error for CodecError {}

#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Complete { packet: Packet, consumed: usize },
    Incomplete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_packet_size_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_packet_size_bytes: DEFAULT_MAX_PACKET_SIZE_BYTES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireCodec {
    config: CodecConfig,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, CodecError> {
        let value = app_config.wire.max_packet_size_bytes;
        if value == 0 {
            return Err(CodecError::InvalidMaxPacketSize { value });
        }

        Ok(Self::new(CodecConfig {
            max_packet_size_bytes: value,
        }))
    }

    pub fn max_packet_size_bytes(&self) -> usize {
        self.config.max_packet_size_bytes
    }

    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let command = packet.command;
        if packet.args.len() != command.arity() {
            return Err(CodecError::ArityMismatch {
                command,
                expected: command.arity(),
                actual: packet.args.len(),
            });
        }

        let last = packet.args.len().saturating_sub(1);
        for (index, arg) in packet.args.iter().enumerate() {
            if index < last && arg.contains(&ARGUMENT_SEPARATOR) {
                return Err(CodecError::SeparatorInArgument { command, index });
            }
        }

        let body_len = packet.body_len();
        if body_len > self.config.max_packet_size_bytes || body_len > u32::MAX as usize {
            return Err(CodecError::BodyTooLarge {
                size: body_len,
                limit: self.config.max_packet_size_bytes,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_SIZE_BYTES + body_len);
        frame.extend_from_slice(&packet.magic.as_bytes());
        frame.extend_from_slice(&command.code().to_be_bytes());
        frame.extend_from_slice(&(body_len as u32).to_be_bytes());
        for (index, arg) in packet.args.iter().enumerate() {
            frame.extend_from_slice(arg);
            if index < last {
                frame.push(ARGUMENT_SEPARATOR);
            }
        }

        Ok(frame)
    }

    /// Decodes the first packet in `buffer`.
    ///
    /// Header fields are validated as soon as their bytes are present, so garbage is rejected
    /// early, while a well-formed packet that is still arriving always yields `Incomplete`.
    pub fn decode(&self, buffer: &[u8]) -> Result<Decoded, CodecError> {
        if buffer.len() < 4 {
            return Ok(Decoded::Incomplete);
        }
        let raw_magic = [buffer[0], buffer[1], buffer[2], buffer[3]];
        let magic = Magic::from_bytes(raw_magic).ok_or(CodecError::InvalidMagic { raw: raw_magic })?;

        if buffer.len() < 8 {
            return Ok(Decoded::Incomplete);
        }
        let code = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
        let command = Command::from_code(code).ok_or(CodecError::UnknownCommand { code })?;

        if buffer.len() < HEADER_SIZE_BYTES {
            return Ok(Decoded::Incomplete);
        }
        let body_len = u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]) as usize;
        if body_len > self.config.max_packet_size_bytes {
            return Err(CodecError::BodyTooLarge {
                size: body_len,
                limit: self.config.max_packet_size_bytes,
            });
        }
        if command.arity() == 0 && body_len > 0 {
            return Err(CodecError::UnexpectedBody {
                command,
                size: body_len,
            });
        }

        let total = HEADER_SIZE_BYTES + body_len;
        if buffer.len() < total {
            return Ok(Decoded::Incomplete);
        }

        let args = split_arguments(command, &buffer[HEADER_SIZE_BYTES..total])?;
        Ok(Decoded::Complete {
            packet: Packet {
                magic,
                command,
                args,
            },
            consumed: total,
        })
    }
}

fn split_arguments(command: Command, body: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    let arity = command.arity();
    if arity == 0 {
        return Ok(Vec::new());
    }

    let mut args = Vec::with_capacity(arity);
    let mut rest = body;
    for _ in 0..arity - 1 {
        let Some(position) = rest.iter().position(|byte| *byte == ARGUMENT_SEPARATOR) else {
            return Err(CodecError::MissingSeparator {
                command,
                expected: arity - 1,
                found: args.len(),
            });
        };
        args.push(rest[..position].to_vec());
        rest = &rest[position + 1..];
    }
    args.push(rest.to_vec());

    Ok(args)
}
