use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::server::Broker;
use crate::shutdown::ShutdownSignal;
use crate::wire::connection::{Connection, ConnectionError, Received};
use crate::wire::packet::Packet;

use super::{interpret, Request, PROTOCOL_ERROR_CODE, ROLE_MISMATCH_CODE};

const LOG_CONTEXT: &str = "wire::session";

enum Flow {
    Continue,
    Close(&'static str),
}

// Drives one connection until the peer leaves, the outbox fails, or shutdown is requested.
pub fn serve_connection(
    mut connection: Connection,
    broker: Arc<Broker>,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
    logger: Arc<Logger>,
) {
    let connection_id = connection.id();
    broker.register(connection_id, connection.sender());
    logger.log(
        LogLevel::Info,
        Some(LOG_CONTEXT),
        "Connection accepted",
        Some(json!({
            "connection_id": connection_id,
            "peer_addr": connection.peer_addr().map(|addr| addr.to_string()),
            "open_connections": broker.connection_count()
        })),
    );

    let reason = loop {
        if shutdown.is_triggered() {
            break "shutdown";
        }
        if connection.outbox_failed() || connection.flush().is_err() {
            break "outbox failed";
        }

        match connection.receive_next() {
            Ok(Received::Packet(packet)) => {
                if let Flow::Close(reason) = handle_packet(&mut connection, &broker, &packet, &logger) {
                    break reason;
                }
            }
            Ok(Received::Idle) => thread::sleep(poll_interval),
            Ok(Received::Closed) => break "peer closed",
            Err(ConnectionError::Decode(error)) => {
                logger.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    "Undecodable packet; closing connection",
                    Some(json!({"connection_id": connection_id, "error": error.to_string()})),
                );
                let _ = connection.send(&Packet::error(PROTOCOL_ERROR_CODE, &error.to_string()));
                let _ = connection.flush();
                break "protocol error";
            }
            Err(_) => break "read failed",
        }
    };

    let client_id = broker.with_dispatcher(|dispatcher| {
        dispatcher.client_id(connection_id).map(str::to_owned)
    });
    broker.disconnect(connection_id);
    connection.close();
    logger.log(
        LogLevel::Info,
        Some(LOG_CONTEXT),
        "Connection closed",
        Some(json!({
            "connection_id": connection_id,
            "role": connection.role().as_str(),
            "client_id": client_id,
            "abilities": connection.abilities().collect::<Vec<_>>(),
            "reason": reason
        })),
    );
}

fn handle_packet(
    connection: &mut Connection,
    broker: &Broker,
    packet: &Packet,
    logger: &Logger,
) -> Flow {
    let request = match interpret(packet) {
        Ok(request) => request,
        Err(error) => {
            logger.log(
                LogLevel::Debug,
                Some(LOG_CONTEXT),
                "Rejected packet",
                Some(json!({
                    "connection_id": connection.id(),
                    "command": packet.command.name(),
                    "error": error.to_string()
                })),
            );
            let _ = connection.send(&error.to_packet());
            if error.closes_connection() {
                let _ = connection.flush();
                return Flow::Close("response magic from peer");
            }
            return Flow::Continue;
        }
    };

    if let Err(error) = connection.claim_role(request.role()) {
        let _ = connection.send(&Packet::error(ROLE_MISMATCH_CODE, &error.to_string()));
        return Flow::Continue;
    }

    match &request {
        Request::CanDo { function_name } if !function_name.is_empty() => {
            connection.add_ability(function_name)
        }
        Request::CantDo { function_name } => connection.remove_ability(function_name),
        Request::ResetAbilities => connection.clear_abilities(),
        _ => {}
    }

    logger.log(
        LogLevel::Verbose,
        Some(LOG_CONTEXT),
        "Packet received",
        Some(json!({
            "connection_id": connection.id(),
            "command": packet.command.name(),
            "body_len": packet.body_len()
        })),
    );
    broker.dispatch(connection.id(), request);
    Flow::Continue
}
