// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. mc_protocol contributors.

//! Server-side implementation of the legacy (pre-Netty) Minecraft
//! multiplayer wire protocol: a completion-based I/O engine, a
//! memory-mapped ring buffer pipeline, a bit-exact packet codec, and the
//! handshake/authenticate/play session state machine.
//!
//! World simulation is explicitly out of scope. Decoded gameplay packets
//! that the protocol state machine does not itself act on are handed to
//! a caller-supplied [`GameplaySink`].

pub mod codec;
pub mod cursor;
pub mod engine;
pub mod frame;
pub mod pool;
pub mod ring_buffer;
pub mod session;
pub mod state_machine;

use std::fmt;

use frame::SessionHandle;

pub use codec::{ClientPacket, ServerPacket};
pub use engine::Engine;
pub use session::Session;

/// Startup parameters, already resolved by the caller (the binary crate
/// converts its `clap` CLI struct into this before constructing an
/// [`Engine`]; the library itself never parses arguments or reads the
/// environment).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub max_connections: u32,
    pub queue_depth: u32,
    /// Arena size (in frames) for the frame pool; `0` requests the
    /// built-in default.
    pub frame_pool_size: u32,
    pub log_level: log::LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:25565".to_string(),
            max_connections: 256,
            queue_depth: 1024,
            frame_pool_size: 0,
            log_level: log::LevelFilter::Info,
        }
    }
}

impl Config {
    /// Number of frames the pool is created with when `frame_pool_size`
    /// is `0`: four in-flight operations per connection (accept slack
    /// included) is generous headroom for the single-threaded engine.
    pub fn resolved_frame_pool_size(&self) -> usize {
        if self.frame_pool_size == 0 {
            (self.max_connections as usize).max(1) * 4
        } else {
            self.frame_pool_size as usize
        }
    }

    pub fn resolved_queue_depth(&self) -> u32 {
        if self.queue_depth == 0 {
            1024
        } else {
            self.queue_depth
        }
    }

    /// Rejects configurations the engine cannot run with. The library
    /// never guesses a substitute for an invalid value; the caller must
    /// fix it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ZeroMaxConnections,
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroMaxConnections => write!(f, "max_connections must be at least 1"),
        }
    }
}

/// The hand-off interface for decoded gameplay packets (PLAYER_GROUNDED,
/// PLAYER_POSITION, PLAYER_ROTATION, PLAYER_TRANSFORM) that the protocol
/// state machine itself does not act on. The engine is generic over
/// `S: GameplaySink`, the direct analogue of the reference crate's
/// `RpcServer<T>` being generic over a user-supplied state type.
pub trait GameplaySink {
    fn on_gameplay_packet(&mut self, session: SessionHandle, packet: ClientPacket);
}

/// A no-op sink, for tests and for running the server standalone.
#[derive(Debug, Default)]
pub struct NullSink;

impl GameplaySink for NullSink {
    fn on_gameplay_packet(&mut self, _session: SessionHandle, _packet: ClientPacket) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let mut config = Config::default();
        config.max_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroMaxConnections)
        ));
    }

    #[test]
    fn zero_frame_pool_size_resolves_to_a_default() {
        let mut config = Config::default();
        config.max_connections = 10;
        config.frame_pool_size = 0;
        assert_eq!(config.resolved_frame_pool_size(), 40);
    }

    #[test]
    fn explicit_frame_pool_size_is_honoured() {
        let mut config = Config::default();
        config.frame_pool_size = 777;
        assert_eq!(config.resolved_frame_pool_size(), 777);
    }

    struct RecordingSink {
        received: Vec<ClientPacket>,
    }

    impl GameplaySink for RecordingSink {
        fn on_gameplay_packet(&mut self, _session: SessionHandle, packet: ClientPacket) {
            self.received.push(packet);
        }
    }

    #[test]
    fn gameplay_sink_only_sees_gameplay_packets() {
        let mut sink = RecordingSink {
            received: Vec::new(),
        };
        let handle = SessionHandle {
            index: 0,
            generation: 0,
        };

        for packet in [
            ClientPacket::Heartbeat,
            ClientPacket::PlayerGrounded { grounded: true },
            ClientPacket::Handshake {
                name: "Steve".to_string(),
            },
            ClientPacket::PlayerRotation {
                yaw: 0.0,
                pitch: 0.0,
                grounded: true,
            },
        ] {
            if packet.is_gameplay() {
                sink.on_gameplay_packet(handle, packet);
            }
        }

        assert_eq!(sink.received.len(), 2);
    }
}
