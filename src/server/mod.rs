use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use crate::config::{AppConfig, ServerConfig, WireConfig};
use crate::logging::{LogLevel, Logger};
use crate::orchestrator::dispatcher::{Dispatcher, Outbound};
use crate::orchestrator::ConnectionId;
use crate::shutdown::ShutdownSignal;
use crate::wire::codec::WireCodec;
use crate::wire::connection::{Connection, PacketSender};
use crate::wire::session::runtime::serve_connection;
use crate::wire::session::Request;

const LOG_CONTEXT: &str = "server";

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    LocalAddr {
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::LocalAddr { source } => {
                write!(f, "failed to read TCP server local address: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

/// The dispatcher plus the directory used to reach every live connection. Outbound packets
/// are pushed into outboxes while the dispatcher lock is held.
pub struct Broker {
    dispatcher: Mutex<Dispatcher>,
    directory: Mutex<HashMap<ConnectionId, PacketSender>>,
    logger: Arc<Logger>,
}

impl Broker {
    pub fn new(dispatcher: Dispatcher, logger: Arc<Logger>) -> Self {
        Self {
            dispatcher: Mutex::new(dispatcher),
            directory: Mutex::new(HashMap::new()),
            logger,
        }
    }

    pub fn register(&self, connection_id: ConnectionId, sender: PacketSender) {
        self.directory
            .lock()
            .expect("connection directory lock poisoned")
            .insert(connection_id, sender);
    }

    pub fn dispatch(&self, connection_id: ConnectionId, request: Request) {
        let mut dispatcher = self.dispatcher.lock().expect("dispatcher lock poisoned");
        let outbound = dispatcher.dispatch(connection_id, request);
        self.deliver(outbound);
    }

    /// Forgets the connection and runs the dispatcher's requeue/observer cleanup.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let mut dispatcher = self.dispatcher.lock().expect("dispatcher lock poisoned");
        self.directory
            .lock()
            .expect("connection directory lock poisoned")
            .remove(&connection_id);
        let outbound = dispatcher.connection_closed(connection_id);
        self.deliver(outbound);
    }

    pub fn with_dispatcher<R>(&self, operation: impl FnOnce(&mut Dispatcher) -> R) -> R {
        let mut dispatcher = self.dispatcher.lock().expect("dispatcher lock poisoned");
        operation(&mut dispatcher)
    }

    pub fn connection_count(&self) -> usize {
        self.directory
            .lock()
            .expect("connection directory lock poisoned")
            .len()
    }

    fn deliver(&self, outbound: Vec<Outbound>) {
        if outbound.is_empty() {
            return;
        }
        let directory = self
            .directory
            .lock()
            .expect("connection directory lock poisoned");
        for item in outbound {
            let Some(sender) = directory.get(&item.connection_id) else {
                self.logger.log(
                    LogLevel::Verbose,
                    Some(LOG_CONTEXT),
                    "Dropping packet for departed connection",
                    Some(json!({
                        "connection_id": item.connection_id,
                        "command": item.packet.command.name()
                    })),
                );
                continue;
            };
            if let Err(error) = sender.send(&item.packet) {
                self.logger.log(
                    LogLevel::Debug,
                    Some(LOG_CONTEXT),
                    "Outbound delivery failed; connection will be closed",
                    Some(json!({
                        "connection_id": item.connection_id,
                        "command": item.packet.command.name(),
                        "error": error.to_string()
                    })),
                );
            }
        }
    }
}

type ConnectionBody = Box<dyn FnOnce() + Send>;
type ConnectionSpawner = fn(String, ConnectionBody) -> io::Result<JoinHandle<()>>;

fn spawn_named(name: String, body: ConnectionBody) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name).spawn(body)
}

pub struct TcpServer {
    listener: TcpListener,
    spawner: ConnectionSpawner,
    local_addr: SocketAddr,
    next_connection_id: AtomicU64,
    codec: WireCodec,
    wire: WireConfig,
    logger: Arc<Logger>,
}

impl TcpServer {
    pub fn bind(
        config: &ServerConfig,
        wire: WireConfig,
        codec: WireCodec,
        logger: Arc<Logger>,
    ) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::LocalAddr { source })?;

        Ok(Self {
            listener,
            spawner: spawn_named,
            local_addr,
            next_connection_id: AtomicU64::new(1),
            codec,
            wire,
            logger,
        })
    }

    pub fn from_app_config(
        app_config: &AppConfig,
        codec: WireCodec,
        logger: Arc<Logger>,
    ) -> Result<Self, ServerError> {
        Self::bind(&app_config.server, app_config.wire, codec, logger)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg(test)]
    fn with_spawner(mut self, spawner: ConnectionSpawner) -> Self {
        self.spawner = spawner;
        self
    }

    /// Accepts connections until `shutdown` fires, one thread per connection, then joins them.
    /// A connection whose thread cannot be spawned is dropped and accepting carries on.
    pub fn serve(&self, broker: Arc<Broker>, shutdown: ShutdownSignal) {
        let poll_interval = Duration::from_millis(self.wire.poll_interval_ms.max(1));
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        while !shutdown.is_triggered() {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    let connection =
                        match Connection::from_tcp(connection_id, stream, self.codec, &self.wire) {
                            Ok(connection) => connection,
                            Err(error) => {
                                self.logger.log(
                                    LogLevel::Warn,
                                    Some(LOG_CONTEXT),
                                    "Failed to configure accepted connection",
                                    Some(json!({
                                        "peer_addr": peer_addr.to_string(),
                                        "error": error.to_string()
                                    })),
                                );
                                continue;
                            }
                        };

                    let broker = Arc::clone(&broker);
                    let shutdown = shutdown.clone();
                    let logger = Arc::clone(&self.logger);
                    let body: ConnectionBody = Box::new(move || {
                        serve_connection(connection, broker, shutdown, poll_interval, logger)
                    });
                    match (self.spawner)(format!("gearhop-conn-{connection_id}"), body) {
                        Ok(handle) => workers.push(handle),
                        Err(error) => {
                            // The unspawned body owns the stream; dropping it hangs up on the peer.
                            self.logger.log(
                                LogLevel::Warn,
                                Some(LOG_CONTEXT),
                                "Failed to spawn connection thread; dropping connection",
                                Some(json!({
                                    "connection_id": connection_id,
                                    "peer_addr": peer_addr.to_string(),
                                    "error": error.to_string()
                                })),
                            );
                        }
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    workers.retain(|worker| !worker.is_finished());
                    thread::sleep(poll_interval);
                }
                Err(error) => {
                    self.logger.log(
                        LogLevel::Warn,
                        Some(LOG_CONTEXT),
                        "Accept failed",
                        Some(json!({"error": error.to_string()})),
                    );
                    thread::sleep(poll_interval);
                }
            }
        }

        self.logger.info(
            Some(LOG_CONTEXT),
            "Accept loop stopped; waiting for connection threads",
        );
        for worker in workers {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use crate::client::Client;
    use crate::config::{AppConfig, ServerConfig};
    use crate::logging::Logger;
    use crate::orchestrator::dispatcher::{Dispatcher, DispatcherConfig};
    use crate::shutdown::ShutdownSignal;
    use crate::storage::MemoryQueueStore;
    use crate::wire::codec::WireCodec;

    use super::{spawn_named, Broker, ConnectionBody, TcpServer};

    static SPAWN_ATTEMPTS: AtomicUsize = AtomicUsize::new(0);

    fn fail_first_spawn(name: String, body: ConnectionBody) -> io::Result<JoinHandle<()>> {
        if SPAWN_ATTEMPTS.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "thread limit reached"));
        }
        spawn_named(name, body)
    }

    #[test]
    fn failed_connection_spawn_keeps_accepting_others() {
        let mut app_config = AppConfig::default();
        app_config.wire.poll_interval_ms = 2;
        let logger = Arc::new(Logger::silent());
        let dispatcher = Dispatcher::new(
            DispatcherConfig::from(&app_config.broker),
            Arc::new(MemoryQueueStore::new()),
            Arc::clone(&logger),
        );
        let broker = Arc::new(Broker::new(dispatcher, Arc::clone(&logger)));
        let server = TcpServer::bind(
            &ServerConfig {
                host: "127.0.0.1".to_owned(),
                port: 0,
            },
            app_config.wire,
            WireCodec::default(),
            logger,
        )
        .expect("bind loopback")
        .with_spawner(fail_first_spawn);
        let address = server.local_addr();

        let shutdown = ShutdownSignal::new();
        let serve_broker = Arc::clone(&broker);
        let serve_shutdown = shutdown.clone();
        let serving = thread::spawn(move || server.serve(serve_broker, serve_shutdown));

        let mut dropped = TcpStream::connect(address).expect("first connect");
        dropped
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        let mut chunk = [0_u8; 16];
        match dropped.read(&mut chunk) {
            Ok(0) => {}
            Ok(read) => panic!("unexpected {read} bytes on a dropped connection"),
            Err(error) => assert_eq!(error.kind(), io::ErrorKind::ConnectionReset),
        }

        let mut client = Client::connect(address, WireCodec::default()).expect("second connect");
        client.set_timeout(Duration::from_secs(5));
        assert_eq!(client.echo(b"still here").expect("echo"), b"still here".to_vec());
        assert_eq!(broker.connection_count(), 1);

        shutdown.trigger();
        serving.join().expect("serve thread");
        assert_eq!(SPAWN_ATTEMPTS.load(Ordering::SeqCst), 2);
    }
}
