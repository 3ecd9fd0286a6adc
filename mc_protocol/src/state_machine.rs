// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. mc_protocol contributors.

//! Per-session protocol state machine: HANDSHAKING -> AUTHENTICATING ->
//! CONNECTED, with DISCONNECTING reachable from any state.
//!
//! This module is deliberately free of I/O: it mutates the [`Session`]
//! row's status and username and returns an [`Action`] describing what
//! the caller (the I/O engine) should do next. Gameplay packets the
//! state machine itself has no opinion about are forwarded to the
//! caller-supplied [`GameplaySink`] before returning.

use log::{debug, info, warn};

use crate::codec::{ClientPacket, ServerPacket};
use crate::frame::SessionHandle;
use crate::session::{Session, Status};
use crate::GameplaySink;

/// What the I/O engine should do after a packet has been run through the
/// state machine.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Enqueue this reply on the session's socket.
    Reply(ServerPacket),
    /// Close the session. A best-effort DISCONNECT reply is sent first
    /// when one is present; a failure to send it does not change the
    /// outcome (logged at DEBUG by the caller).
    Disconnect(Option<ServerPacket>),
    /// No reply, no disconnect (e.g. a gameplay packet already forwarded
    /// to the sink).
    None,
}

const AUTH_PROTOCOL_VERSION: i32 = 1;

/// Runs one decoded client packet through the state machine for `session`.
pub fn handle_client_packet<S: GameplaySink>(
    session: &mut Session,
    handle: SessionHandle,
    packet: ClientPacket,
    sink: &mut S,
) -> Action {
    match packet {
        ClientPacket::Heartbeat => Action::Reply(ServerPacket::Heartbeat),

        ClientPacket::Handshake { name } => {
            if session.status() != Status::Handshaking {
                warn!(
                    "session {}: HANDSHAKE received while in {:?}",
                    handle.index,
                    session.status()
                );
                session.set_status(Status::Disconnecting);
                return Action::Disconnect(Some(disconnect("unexpected handshake")));
            }
            session.set_username(&name);
            session.set_status(Status::Authenticating);
            Action::Reply(ServerPacket::Handshake {
                unknown: "-".to_string(),
            })
        }

        ClientPacket::Authentication {
            protocol_version, ..
        } => {
            if session.status() != Status::Authenticating {
                warn!(
                    "session {}: AUTHENTICATION received while in {:?}",
                    handle.index,
                    session.status()
                );
                session.set_status(Status::Disconnecting);
                return Action::Disconnect(Some(disconnect("unexpected authentication")));
            }
            if protocol_version != AUTH_PROTOCOL_VERSION {
                warn!(
                    "session {}: unsupported protocol version {protocol_version}",
                    handle.index
                );
                session.set_status(Status::Disconnecting);
                return Action::Disconnect(Some(disconnect("unsupported protocol version")));
            }
            session.set_status(Status::Connected);
            Action::Reply(ServerPacket::Authentication {
                entity_id: 0,
                unknown0: String::new(),
                unknown1: String::new(),
            })
        }

        ClientPacket::Disconnect { message } => {
            info!("session {} disconnected: {message}", handle.index);
            session.set_status(Status::Disconnecting);
            Action::Disconnect(None)
        }

        other => {
            debug!(
                "session {}: forwarding gameplay packet {other:?}",
                handle.index
            );
            sink.on_gameplay_packet(handle, other);
            Action::None
        }
    }
}

fn disconnect(message: &str) -> ServerPacket {
    ServerPacket::Disconnect {
        message: message.to_string(),
    }
}
