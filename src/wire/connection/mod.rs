use std::collections::BTreeSet;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};

use crate::config::WireConfig;
use crate::orchestrator::ConnectionId;
use crate::wire::codec::{CodecError, Decoded, WireCodec};
use crate::wire::packet::Packet;

const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Undetermined,
    Client,
    Worker,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Undetermined => "undetermined",
            Self::Client => "client",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum ConnectionError {
    Decode(CodecError),
    Encode(CodecError),
    Io(io::Error),
    OutboxOverflow { pending: usize, limit: usize },
    OutboxFailed,
    AlreadyClosed,
    RoleMismatch { current: Role, requested: Role },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(source) => write!(f, "failed to decode inbound packet: {source}"),
            Self::Encode(source) => write!(f, "failed to encode outbound packet: {source}"),
            Self::Io(source) => write!(f, "connection I/O failed: {source}"),
            Self::OutboxOverflow { pending, limit } => write!(
                f,
                "pending write buffer of {pending} bytes exceeds limit of {limit} bytes"
            ),
            Self::OutboxFailed => write!(f, "outbox already failed"),
            Self::AlreadyClosed => write!(f, "connection already closed"),
            Self::RoleMismatch { current, requested } => write!(
                f,
                "connection acts as {current} and cannot issue {requested} commands"
            ),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Accumulates inbound bytes and peels complete packets off the front.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    pub fn next_packet(&mut self, codec: &WireCodec) -> Result<Option<Packet>, CodecError> {
        if self.bytes.is_empty() {
            return Ok(None);
        }
        match codec.decode(&self.bytes)? {
            Decoded::Complete { packet, consumed } => {
                self.bytes.drain(..consumed);
                Ok(Some(packet))
            }
            Decoded::Incomplete => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Pending-write buffer in front of a possibly non-blocking writer.
pub struct Outbox {
    writer: Box<dyn Write + Send>,
    pending: Vec<u8>,
    max_pending_bytes: usize,
    failed: bool,
}

impl Outbox {
    pub fn new(writer: Box<dyn Write + Send>, max_pending_bytes: usize) -> Self {
        Self {
            writer,
            pending: Vec::new(),
            max_pending_bytes,
            failed: false,
        }
    }

    pub fn enqueue(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if self.failed {
            return Err(ConnectionError::OutboxFailed);
        }
        let pending = self.pending.len() + bytes.len();
        if pending > self.max_pending_bytes {
            self.failed = true;
            return Err(ConnectionError::OutboxOverflow {
                pending,
                limit: self.max_pending_bytes,
            });
        }
        self.pending.extend_from_slice(bytes);
        Ok(())
    }

    /// Writes as much as the writer accepts without blocking; returns the bytes written.
    pub fn flush(&mut self) -> Result<usize, ConnectionError> {
        if self.failed {
            return Err(ConnectionError::OutboxFailed);
        }

        let mut written = 0usize;
        while written < self.pending.len() {
            match self.writer.write(&self.pending[written..]) {
                Ok(0) => {
                    self.failed = true;
                    return Err(ConnectionError::Io(io::Error::from(io::ErrorKind::WriteZero)));
                }
                Ok(count) => written += count,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    self.failed = true;
                    return Err(ConnectionError::Io(error));
                }
            }
        }
        self.pending.drain(..written);
        Ok(written)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }
}

/// Cloneable handle used to push packets into a connection's outbox from any thread.
#[derive(Clone)]
pub struct PacketSender {
    codec: WireCodec,
    outbox: Arc<Mutex<Outbox>>,
}

impl PacketSender {
    pub fn new(codec: WireCodec, outbox: Outbox) -> Self {
        Self {
            codec,
            outbox: Arc::new(Mutex::new(outbox)),
        }
    }

    pub fn send(&self, packet: &Packet) -> Result<(), ConnectionError> {
        let bytes = self.codec.encode(packet).map_err(ConnectionError::Encode)?;
        let mut outbox = self.outbox.lock().expect("outbox lock poisoned");
        outbox.enqueue(&bytes)?;
        outbox.flush().map(|_| ())
    }

    pub fn flush(&self) -> Result<usize, ConnectionError> {
        self.outbox.lock().expect("outbox lock poisoned").flush()
    }

    pub fn pending_len(&self) -> usize {
        self.outbox.lock().expect("outbox lock poisoned").pending_len()
    }

    pub fn is_failed(&self) -> bool {
        self.outbox.lock().expect("outbox lock poisoned").is_failed()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Packet(Packet),
    /// Nothing complete is buffered and the socket has nothing to read right now.
    Idle,
    Closed,
}

pub struct Connection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    reader: Box<dyn Read + Send>,
    socket: Option<TcpStream>,
    codec: WireCodec,
    frames: FrameBuffer,
    read_chunk: Vec<u8>,
    sender: PacketSender,
    role: Role,
    abilities: BTreeSet<String>,
    closed: bool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        codec: WireCodec,
        max_pending_write_bytes: usize,
    ) -> Self {
        Self {
            id,
            peer_addr: None,
            reader,
            socket: None,
            codec,
            frames: FrameBuffer::new(),
            read_chunk: vec![0; READ_CHUNK_BYTES],
            sender: PacketSender::new(codec, Outbox::new(writer, max_pending_write_bytes)),
            role: Role::Undetermined,
            abilities: BTreeSet::new(),
            closed: false,
        }
    }

    pub fn from_tcp(
        id: ConnectionId,
        stream: TcpStream,
        codec: WireCodec,
        wire: &WireConfig,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let peer_addr = stream.peer_addr().ok();
        let writer = stream.try_clone()?;
        let reader = stream.try_clone()?;

        let mut connection = Self::new(
            id,
            Box::new(reader),
            Box::new(writer),
            codec,
            wire.max_pending_write_bytes,
        );
        connection.peer_addr = peer_addr;
        connection.socket = Some(stream);
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn sender(&self) -> PacketSender {
        self.sender.clone()
    }

    /// Settles the role on the first role-specific command and rejects the other family after.
    pub fn claim_role(&mut self, requested: Option<Role>) -> Result<(), ConnectionError> {
        let Some(requested) = requested else {
            return Ok(());
        };
        match self.role {
            Role::Undetermined => {
                self.role = requested;
                Ok(())
            }
            current if current == requested => Ok(()),
            current => Err(ConnectionError::RoleMismatch { current, requested }),
        }
    }

    pub fn abilities(&self) -> impl Iterator<Item = &str> {
        self.abilities.iter().map(String::as_str)
    }

    pub fn add_ability(&mut self, function_name: &str) {
        self.abilities.insert(function_name.to_owned());
    }

    pub fn remove_ability(&mut self, function_name: &str) {
        self.abilities.remove(function_name);
    }

    pub fn clear_abilities(&mut self) {
        self.abilities.clear();
    }

    pub fn receive_next(&mut self) -> Result<Received, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::AlreadyClosed);
        }

        loop {
            if let Some(packet) = self
                .frames
                .next_packet(&self.codec)
                .map_err(ConnectionError::Decode)?
            {
                return Ok(Received::Packet(packet));
            }

            match self.reader.read(&mut self.read_chunk) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(Received::Closed);
                }
                Ok(count) => self.frames.extend(&self.read_chunk[..count]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Received::Idle);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.closed = true;
                    return Ok(Received::Closed);
                }
            }
        }
    }

    pub fn send(&self, packet: &Packet) -> Result<(), ConnectionError> {
        self.sender.send(packet)
    }

    pub fn flush(&self) -> Result<usize, ConnectionError> {
        self.sender.flush()
    }

    pub fn outbox_failed(&self) -> bool {
        self.sender.is_failed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}
