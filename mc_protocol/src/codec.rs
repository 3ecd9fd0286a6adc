// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. mc_protocol contributors.

//! Deterministic, bit-exact encoder/decoder for the packet family.
//!
//! Every decoder and encoder here is a pure function: no I/O, no
//! allocation beyond what's needed to build the decoded value itself.
//! All multi-byte integers are big-endian; strings are UTF-8 prefixed
//! with a big-endian `u16` length.
//!
//! The wire protocol's three-valued return convention (positive =
//! consumed/written bytes, negative magnitude = bytes still needed,
//! zero = structural error) is exposed here as the [`DecodeOutcome`] and
//! [`EncodeOutcome`] sum types rather than as raw signed integers -- the
//! signed convention is an encoding detail these types are built from, not
//! part of the public API.

const MAX_USERNAME_LEN: usize = 16;
const MAX_PASSWORD_LEN: usize = 32;

/// Tag bytes from the wire format.
mod tag {
    pub const HEARTBEAT: u8 = 0x00;
    pub const AUTHENTICATION: u8 = 0x01;
    pub const HANDSHAKE: u8 = 0x02;
    pub const TIME: u8 = 0x04;
    pub const PLAYER_GROUNDED: u8 = 0x0A;
    pub const PLAYER_POSITION: u8 = 0x0B;
    pub const PLAYER_ROTATION: u8 = 0x0C;
    pub const PLAYER_TRANSFORM: u8 = 0x0D;
    pub const CHUNK: u8 = 0x32;
    pub const CHUNK_DATA: u8 = 0x33;
    pub const DISCONNECT: u8 = 0xFF;
}

/// A packet sent by the client and decoded by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    Heartbeat,
    Authentication {
        protocol_version: i32,
        username: String,
        password: String,
    },
    Handshake {
        name: String,
    },
    PlayerGrounded {
        grounded: bool,
    },
    PlayerPosition {
        x: f64,
        y: f64,
        head_y: f64,
        z: f64,
        grounded: bool,
    },
    PlayerRotation {
        yaw: f32,
        pitch: f32,
        grounded: bool,
    },
    PlayerTransform {
        x: f64,
        y: f64,
        head_y: f64,
        z: f64,
        yaw: f32,
        pitch: f32,
        grounded: bool,
    },
    Disconnect {
        message: String,
    },
}

impl ClientPacket {
    /// The gameplay packets are the ones the protocol state machine itself
    /// does not act on and forwards to the gameplay hand-off channel.
    pub fn is_gameplay(&self) -> bool {
        matches!(
            self,
            ClientPacket::PlayerGrounded { .. }
                | ClientPacket::PlayerPosition { .. }
                | ClientPacket::PlayerRotation { .. }
                | ClientPacket::PlayerTransform { .. }
        )
    }
}

/// A packet sent by the server, encoded for the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    Heartbeat,
    Authentication {
        entity_id: i32,
        unknown0: String,
        unknown1: String,
    },
    Handshake {
        unknown: String,
    },
    Time {
        ticks: i64,
    },
    /// Note the wire order swap versus the client's request: the server
    /// writes x, head_y, y, z (head_y and y swapped relative to
    /// [`ClientPacket::PlayerTransform`]).
    PlayerTransform {
        x: f64,
        y: f64,
        head_y: f64,
        z: f64,
        yaw: f32,
        pitch: f32,
        grounded: bool,
    },
    Chunk {
        x: i32,
        z: i32,
        initialize: bool,
    },
    ChunkData {
        x: i32,
        y: i16,
        z: i32,
        x_size: u8,
        y_size: u8,
        z_size: u8,
        data: Vec<u8>,
    },
    Disconnect {
        message: String,
    },
}

/// Result of attempting to decode one packet from a byte span.
#[derive(Debug, PartialEq)]
pub enum DecodeOutcome {
    /// Decoded successfully; consumed this many bytes from the front of
    /// the span.
    Consumed(usize, ClientPacket),
    /// Incomplete: this many additional bytes are needed before the
    /// decoder can make further progress.
    Need(usize),
    /// Structurally invalid: the tag is unknown, or a length field
    /// violates its cap. The caller must disconnect the session.
    Invalid,
}

/// Result of attempting to encode a packet into a byte span.
#[derive(Debug, PartialEq)]
pub enum EncodeOutcome {
    /// Encoded successfully; wrote this many bytes.
    Written(usize),
    /// The destination buffer was too small; this many additional bytes
    /// are required.
    Need(usize),
}

/// Reads a decoded client packet, tag byte included, from the front of
/// `buf`. Never reads or retains bytes beyond the one packet it decodes.
pub fn decode_client_packet(buf: &[u8]) -> DecodeOutcome {
    let mut r = Reader::new(buf);
    let tag = match r.read_u8() {
        Ok(t) => t,
        Err(need) => return DecodeOutcome::Need(need),
    };

    let packet = match tag {
        tag::HEARTBEAT => Ok(ClientPacket::Heartbeat),
        tag::AUTHENTICATION => decode_authentication(&mut r),
        tag::HANDSHAKE => decode_handshake(&mut r),
        tag::PLAYER_GROUNDED => decode_player_grounded(&mut r),
        tag::PLAYER_POSITION => decode_player_position(&mut r),
        tag::PLAYER_ROTATION => decode_player_rotation(&mut r),
        tag::PLAYER_TRANSFORM => decode_player_transform(&mut r),
        tag::DISCONNECT => decode_disconnect(&mut r),
        _ => Err(Outcome::Invalid),
    };

    match packet {
        Ok(p) => DecodeOutcome::Consumed(r.pos, p),
        Err(Outcome::Need(n)) => DecodeOutcome::Need(n),
        Err(Outcome::Invalid) => DecodeOutcome::Invalid,
    }
}

/// Computes the exact number of bytes `encode` will write for `packet`,
/// so a caller can allocate a correctly sized buffer up front instead of
/// probing with a null target.
pub fn encoded_size(packet: &ServerPacket) -> usize {
    match packet {
        ServerPacket::Heartbeat => 1,
        ServerPacket::Authentication {
            unknown0, unknown1, ..
        } => 1 + 4 + string_size(unknown0) + string_size(unknown1),
        ServerPacket::Handshake { unknown } => 1 + string_size(unknown),
        ServerPacket::Time { .. } => 1 + 8,
        ServerPacket::PlayerTransform { .. } => 1 + 8 * 4 + 4 * 2 + 1,
        ServerPacket::Chunk { .. } => 1 + 4 + 4 + 1,
        ServerPacket::ChunkData { data, .. } => 1 + 4 + 2 + 4 + 1 + 1 + 1 + 4 + data.len(),
        ServerPacket::Disconnect { message } => 1 + string_size(message),
    }
}

/// Encodes `packet` into `buf`. Returns `Need(k)` without writing
/// anything if `buf` is shorter than `encoded_size(packet)`, matching the
/// codec's "check length before writing any bytes" contract.
pub fn encode(packet: &ServerPacket, buf: &mut [u8]) -> EncodeOutcome {
    let needed = encoded_size(packet);
    if buf.len() < needed {
        return EncodeOutcome::Need(needed - buf.len());
    }

    let mut w = Writer::new(&mut buf[..needed]);
    match packet {
        ServerPacket::Heartbeat => {
            w.write_u8(tag::HEARTBEAT);
        }
        ServerPacket::Authentication {
            entity_id,
            unknown0,
            unknown1,
        } => {
            w.write_u8(tag::AUTHENTICATION);
            w.write_i32(*entity_id);
            w.write_string(unknown0);
            w.write_string(unknown1);
        }
        ServerPacket::Handshake { unknown } => {
            w.write_u8(tag::HANDSHAKE);
            w.write_string(unknown);
        }
        ServerPacket::Time { ticks } => {
            w.write_u8(tag::TIME);
            w.write_i64(*ticks);
        }
        ServerPacket::PlayerTransform {
            x,
            y,
            head_y,
            z,
            yaw,
            pitch,
            grounded,
        } => {
            w.write_u8(tag::PLAYER_TRANSFORM);
            w.write_f64(*x);
            w.write_f64(*head_y);
            w.write_f64(*y);
            w.write_f64(*z);
            w.write_f32(*yaw);
            w.write_f32(*pitch);
            w.write_bool(*grounded);
        }
        ServerPacket::Chunk { x, z, initialize } => {
            w.write_u8(tag::CHUNK);
            w.write_i32(*x);
            w.write_i32(*z);
            w.write_bool(*initialize);
        }
        ServerPacket::ChunkData {
            x,
            y,
            z,
            x_size,
            y_size,
            z_size,
            data,
        } => {
            w.write_u8(tag::CHUNK_DATA);
            w.write_i32(*x);
            w.write_i16(*y);
            w.write_i32(*z);
            w.write_u8(*x_size);
            w.write_u8(*y_size);
            w.write_u8(*z_size);
            w.write_i32(data.len() as i32);
            w.write_bytes(data);
        }
        ServerPacket::Disconnect { message } => {
            w.write_u8(tag::DISCONNECT);
            w.write_string(message);
        }
    }

    EncodeOutcome::Written(needed)
}

fn string_size(s: &str) -> usize {
    2 + s.len()
}

enum Outcome {
    Need(usize),
    Invalid,
}

fn decode_authentication(r: &mut Reader) -> Result<ClientPacket, Outcome> {
    let protocol_version = r.read_i32()?;
    let username = r.read_string(MAX_USERNAME_LEN)?;
    let password = r.read_string(MAX_PASSWORD_LEN)?;
    Ok(ClientPacket::Authentication {
        protocol_version,
        username,
        password,
    })
}

fn decode_handshake(r: &mut Reader) -> Result<ClientPacket, Outcome> {
    let name = r.read_string(MAX_USERNAME_LEN)?;
    Ok(ClientPacket::Handshake { name })
}

fn decode_player_grounded(r: &mut Reader) -> Result<ClientPacket, Outcome> {
    let grounded = r.read_bool()?;
    Ok(ClientPacket::PlayerGrounded { grounded })
}

fn decode_player_position(r: &mut Reader) -> Result<ClientPacket, Outcome> {
    let x = r.read_f64()?;
    let y = r.read_f64()?;
    let head_y = r.read_f64()?;
    let z = r.read_f64()?;
    let grounded = r.read_bool()?;
    Ok(ClientPacket::PlayerPosition {
        x,
        y,
        head_y,
        z,
        grounded,
    })
}

fn decode_player_rotation(r: &mut Reader) -> Result<ClientPacket, Outcome> {
    let yaw = r.read_f32()?;
    let pitch = r.read_f32()?;
    let grounded = r.read_bool()?;
    Ok(ClientPacket::PlayerRotation {
        yaw,
        pitch,
        grounded,
    })
}

fn decode_player_transform(r: &mut Reader) -> Result<ClientPacket, Outcome> {
    let x = r.read_f64()?;
    let y = r.read_f64()?;
    let head_y = r.read_f64()?;
    let z = r.read_f64()?;
    let yaw = r.read_f32()?;
    let pitch = r.read_f32()?;
    let grounded = r.read_bool()?;
    Ok(ClientPacket::PlayerTransform {
        x,
        y,
        head_y,
        z,
        yaw,
        pitch,
        grounded,
    })
}

fn decode_disconnect(r: &mut Reader) -> Result<ClientPacket, Outcome> {
    let message = r.read_string(u16::MAX as usize)?;
    Ok(ClientPacket::Disconnect { message })
}

/// Incremental big-endian reader over a byte span. Every read either
/// advances `pos` and returns the value, or leaves `pos` untouched and
/// reports how many more bytes are needed for that one field.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Outcome> {
        if self.remaining() < n {
            return Err(Outcome::Need(n - self.remaining()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn read_u8(&mut self) -> Result<u8, usize> {
        if self.remaining() < 1 {
            return Err(1 - self.remaining());
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_bool(&mut self) -> Result<bool, Outcome> {
        let b = self.take(1)?[0];
        Ok(b != 0)
    }

    fn read_i16(&mut self) -> Result<i16, Outcome> {
        let s = self.take(2)?;
        Ok(i16::from_be_bytes(s.try_into().unwrap()))
    }

    fn read_u16(&mut self) -> Result<u16, Outcome> {
        let s = self.take(2)?;
        Ok(u16::from_be_bytes(s.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32, Outcome> {
        let s = self.take(4)?;
        Ok(i32::from_be_bytes(s.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64, Outcome> {
        let s = self.take(8)?;
        Ok(i64::from_be_bytes(s.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> Result<f32, Outcome> {
        let s = self.take(4)?;
        Ok(f32::from_bits(u32::from_be_bytes(s.try_into().unwrap())))
    }

    fn read_f64(&mut self) -> Result<f64, Outcome> {
        let s = self.take(8)?;
        Ok(f64::from_bits(u64::from_be_bytes(s.try_into().unwrap())))
    }

    fn read_string(&mut self, max_len: usize) -> Result<String, Outcome> {
        let len = self.read_u16()? as usize;
        if len > max_len {
            return Err(Outcome::Invalid);
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Outcome::Invalid)
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    fn write_bool(&mut self, v: bool) {
        self.write_u8(if v { 1 } else { 0 });
    }

    fn write_i16(&mut self, v: i16) {
        self.write_bytes(&v.to_be_bytes());
    }

    fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_be_bytes());
    }

    fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_be_bytes());
    }

    fn write_f32(&mut self, v: f32) {
        self.write_bytes(&v.to_bits().to_be_bytes());
    }

    fn write_f64(&mut self, v: f64) {
        self.write_bytes(&v.to_bits().to_be_bytes());
    }

    fn write_string(&mut self, s: &str) {
        self.write_u16(s.len() as u16);
        self.write_bytes(s.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_client(packet: ClientPacket, wire: &[u8]) {
        match decode_client_packet(wire) {
            DecodeOutcome::Consumed(n, decoded) => {
                assert_eq!(n, wire.len());
                assert_eq!(decoded, packet);
            }
            other => panic!("expected Consumed, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_roundtrip() {
        roundtrip_client(ClientPacket::Heartbeat, &[0x00]);
    }

    #[test]
    fn handshake_roundtrip() {
        let mut wire = vec![0x02, 0x00, 0x05];
        wire.extend_from_slice(b"Steve");
        roundtrip_client(
            ClientPacket::Handshake {
                name: "Steve".to_string(),
            },
            &wire,
        );
    }

    #[test]
    fn authentication_roundtrip() {
        let mut wire = vec![0x01];
        wire.extend_from_slice(&1i32.to_be_bytes());
        wire.extend_from_slice(&5u16.to_be_bytes());
        wire.extend_from_slice(b"Steve");
        wire.extend_from_slice(&0u16.to_be_bytes());
        roundtrip_client(
            ClientPacket::Authentication {
                protocol_version: 1,
                username: "Steve".to_string(),
                password: "".to_string(),
            },
            &wire,
        );
    }

    #[test]
    fn player_position_roundtrip() {
        let mut wire = vec![0x0B];
        wire.extend_from_slice(&1.0f64.to_bits().to_be_bytes());
        wire.extend_from_slice(&2.0f64.to_bits().to_be_bytes());
        wire.extend_from_slice(&3.0f64.to_bits().to_be_bytes());
        wire.extend_from_slice(&4.0f64.to_bits().to_be_bytes());
        wire.push(1);
        roundtrip_client(
            ClientPacket::PlayerPosition {
                x: 1.0,
                y: 2.0,
                head_y: 3.0,
                z: 4.0,
                grounded: true,
            },
            &wire,
        );
    }

    #[test]
    fn truncated_buffer_reports_exact_need() {
        // HANDSHAKE with a 5-byte name but only 2 bytes of the name present.
        let mut wire = vec![0x02, 0x00, 0x05];
        wire.extend_from_slice(b"St");
        match decode_client_packet(&wire) {
            DecodeOutcome::Need(n) => assert_eq!(n, 3),
            other => panic!("expected Need(3), got {other:?}"),
        }
    }

    #[test]
    fn need_grows_as_bytes_trickle_in() {
        let mut wire = vec![0x02, 0x00, 0x05];
        wire.extend_from_slice(b"Steve");

        // Split at 3 bytes: only the tag + length prefix is present.
        assert_eq!(decode_client_packet(&wire[..3]), DecodeOutcome::Need(5));
        // Split at 1 byte: not even the length prefix is present yet.
        assert_eq!(decode_client_packet(&wire[..1]), DecodeOutcome::Need(2));
        // Full packet now decodes cleanly.
        match decode_client_packet(&wire) {
            DecodeOutcome::Consumed(n, _) => assert_eq!(n, wire.len()),
            other => panic!("expected Consumed, got {other:?}"),
        }
    }

    #[test]
    fn oversized_username_is_invalid() {
        let mut wire = vec![0x02, 0x00, 17];
        wire.extend_from_slice(&[b'x'; 17]);
        assert_eq!(decode_client_packet(&wire), DecodeOutcome::Invalid);
    }

    #[test]
    fn unknown_tag_is_invalid() {
        assert_eq!(decode_client_packet(&[0x99]), DecodeOutcome::Invalid);
    }

    #[test]
    fn empty_buffer_needs_one_byte() {
        assert_eq!(decode_client_packet(&[]), DecodeOutcome::Need(1));
    }

    #[test]
    fn handshake_response_s1_scenario() {
        let packet = ServerPacket::Handshake {
            unknown: "-".to_string(),
        };
        let size = encoded_size(&packet);
        let mut buf = vec![0u8; size];
        assert_eq!(encode(&packet, &mut buf), EncodeOutcome::Written(size));
        assert_eq!(buf, vec![0x02, 0x00, 0x01, b'-']);
    }

    #[test]
    fn authentication_response_s3_scenario() {
        let packet = ServerPacket::Authentication {
            entity_id: 0,
            unknown0: String::new(),
            unknown1: String::new(),
        };
        let size = encoded_size(&packet);
        let mut buf = vec![0u8; size];
        assert_eq!(encode(&packet, &mut buf), EncodeOutcome::Written(size));
        assert_eq!(
            buf,
            vec![0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn heartbeat_response_s5_scenario() {
        let size = encoded_size(&ServerPacket::Heartbeat);
        let mut buf = vec![0u8; size];
        encode(&ServerPacket::Heartbeat, &mut buf);
        assert_eq!(buf, vec![0x00]);
    }

    #[test]
    fn encode_reports_need_for_short_buffer() {
        let packet = ServerPacket::Heartbeat;
        let mut buf = [0u8; 0];
        assert_eq!(encode(&packet, &mut buf), EncodeOutcome::Need(1));
    }

    #[test]
    fn player_transform_swaps_y_and_head_y_on_send() {
        let packet = ServerPacket::PlayerTransform {
            x: 1.0,
            y: 2.0,
            head_y: 3.0,
            z: 4.0,
            yaw: 0.5,
            pitch: 0.25,
            grounded: true,
        };
        let size = encoded_size(&packet);
        let mut buf = vec![0u8; size];
        encode(&packet, &mut buf);

        let mut r = Reader::new(&buf[1..]);
        assert_eq!(r.read_f64().unwrap(), 1.0); // x
        assert_eq!(r.read_f64().unwrap(), 3.0); // head_y written before y
        assert_eq!(r.read_f64().unwrap(), 2.0); // y
        assert_eq!(r.read_f64().unwrap(), 4.0); // z
    }

    #[test]
    fn chunk_data_roundtrip() {
        let packet = ServerPacket::ChunkData {
            x: 1,
            y: 2,
            z: 3,
            x_size: 4,
            y_size: 5,
            z_size: 6,
            data: vec![9, 9, 9],
        };
        let size = encoded_size(&packet);
        let mut buf = vec![0u8; size];
        assert_eq!(encode(&packet, &mut buf), EncodeOutcome::Written(size));
        assert_eq!(buf[0], tag::CHUNK_DATA);
        assert_eq!(&buf[size - 3..], &[9, 9, 9]);
    }

    #[test]
    fn is_gameplay_classifies_packets_correctly() {
        assert!(!ClientPacket::Heartbeat.is_gameplay());
        assert!(
            !ClientPacket::Handshake {
                name: "x".into()
            }
            .is_gameplay()
        );
        assert!(ClientPacket::PlayerGrounded { grounded: true }.is_gameplay());
        assert!(
            ClientPacket::PlayerRotation {
                yaw: 0.0,
                pitch: 0.0,
                grounded: true
            }
            .is_gameplay()
        );
    }
}
