/*
 * Real Time Protocol Music Instrument Digital Interface Daemon
 * Copyright (C) 2019-2023 David Moreno Montero <dmoreno@coralbits.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */
//! On-the-wire layout of the Apple session packets (IN / OK / NO / BY / CK
//! / RS) and of the RTP-MIDI data datagram.
//!
//! Everything is serialized field by field in network byte order; the
//! bit-packed headers are never memory images of a struct.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::str;

/// Only version 2 is meaningful. It is sent, and ignored on receipt.
pub const PROTOCOL_VERSION: u32 = 2;

/// Max size for one RTP payload.
pub const MAX_RTP_LOAD: usize = 1024;

/// Session names longer than this are not recorded.
pub const MAX_SESSION_NAME_LEN: usize = 63;

pub const LONG_B_BIT: u16 = 0x8000;
pub const LONG_J_BIT: u16 = 0x4000;
pub const LONG_Z_BIT: u16 = 0x2000;
pub const LONG_P_BIT: u16 = 0x1000;

pub const SHORT_J_BIT: u8 = 0x40;
pub const SHORT_Z_BIT: u8 = 0x20;
pub const SHORT_P_BIT: u8 = 0x10;

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum PacketType {
    Unknown,
    IN,
    OK,
    NO,
    BY,
    CK,
    RS,
}

/// Identify an Apple session packet from its first four bytes.
///
/// Anything that does not start with the `0xFF 0xFF` signature followed by
/// a known two-ASCII-byte command is `Unknown` and gets dropped by the
/// caller.
pub fn packet_type(data: &[u8]) -> PacketType {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xFF {
        return PacketType::Unknown;
    }
    match (data[2], data[3]) {
        (b'I', b'N') => PacketType::IN,
        (b'O', b'K') => PacketType::OK,
        (b'N', b'O') => PacketType::NO,
        (b'B', b'Y') => PacketType::BY,
        (b'C', b'K') => PacketType::CK,
        (b'R', b'S') => PacketType::RS,
        _ => PacketType::Unknown,
    }
}

/// Fields shared by the IN / OK / NO / BY session packets.
#[derive(Debug, PartialEq, Clone)]
pub struct SessionPacketFields {
    pub protocol_version: u32,
    pub initiator_token: u32,
    pub ssrc: u32,
    pub name: Option<String>,
}

/// Fields of a CK clock synchronization packet.
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct SyncPacketFields {
    pub ssrc: u32,
    pub count: u8,
    /// TS1H, TS1L, TS2H, TS2L, TS3H, TS3L.
    pub timestamps: [u32; 6],
}

/// Build an IN, OK, NO or BY packet. The session name is appended
/// NUL-terminated when given (BY never carries one).
pub fn build_session_packet(
    command: PacketType,
    initiator_token: u32,
    ssrc: u32,
    name: Option<&str>,
) -> Vec<u8> {
    let command: &[u8; 2] = match command {
        PacketType::IN => b"IN",
        PacketType::OK => b"OK",
        PacketType::NO => b"NO",
        PacketType::BY => b"BY",
        _ => b"IN",
    };
    let mut packet = Vec::with_capacity(16 + name.map_or(0, |n| n.len() + 1));
    packet.extend_from_slice(&[0xFF, 0xFF]);
    packet.extend_from_slice(command);
    packet.write_u32::<BigEndian>(PROTOCOL_VERSION).unwrap();
    packet.write_u32::<BigEndian>(initiator_token).unwrap();
    packet.write_u32::<BigEndian>(ssrc).unwrap();
    if let Some(name) = name {
        if !name.is_empty() {
            packet.extend_from_slice(name.as_bytes());
            packet.push(0x00);
        }
    }
    packet
}

/// Build a 36-byte CK packet. `timestamps` is TS1H..TS3L.
pub fn build_sync_packet(ssrc: u32, count: u8, timestamps: &[u32; 6]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(36);
    packet.extend_from_slice(&[0xFF, 0xFF]);
    packet.extend_from_slice(b"CK");
    packet.write_u32::<BigEndian>(ssrc).unwrap();
    packet.push(count);
    packet.extend_from_slice(&[0, 0, 0]);
    for timestamp in timestamps {
        packet.write_u32::<BigEndian>(*timestamp).unwrap();
    }
    packet
}

/// Build a 12-byte RS receiver feedback packet.
pub fn build_feedback_packet(ssrc: u32, sequence: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(12);
    packet.extend_from_slice(&[0xFF, 0xFF]);
    packet.extend_from_slice(b"RS");
    packet.write_u32::<BigEndian>(ssrc).unwrap();
    packet.write_u16::<BigEndian>(sequence).unwrap();
    packet.write_u16::<BigEndian>(0).unwrap();
    packet
}

/// Build one RTP-MIDI data datagram around an already encoded MIDI command
/// list. Always uses the long payload header: B=1, J=0, Z=0, P=0, 12-bit
/// length. RTP header is V=2, P=0, X=0, CC=0, M=1, PT=0x61.
pub fn build_midi_datagram(sequence: u16, timestamp: u32, ssrc: u32, midi: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(14 + midi.len());
    packet.push(0x80);
    packet.push(0x61);
    packet.write_u16::<BigEndian>(sequence).unwrap();
    packet.write_u32::<BigEndian>(timestamp).unwrap();
    packet.write_u32::<BigEndian>(ssrc).unwrap();
    packet
        .write_u16::<BigEndian>(LONG_B_BIT | (midi.len() as u16 & 0x0FFF))
        .unwrap();
    packet.extend_from_slice(midi);
    packet
}

/// Parse the fixed part and optional name of an IN / OK / NO / BY packet.
/// Returns `None` when the packet is too short or the name is not valid
/// UTF-8; such packets are dropped by the caller.
pub fn parse_session_packet(data: &[u8]) -> Option<SessionPacketFields> {
    if data.len() < 16 {
        return None;
    }
    let mut cursor = Cursor::new(&data[4..16]);
    let protocol_version = cursor.read_u32::<BigEndian>().ok()?;
    let initiator_token = cursor.read_u32::<BigEndian>().ok()?;
    let ssrc = cursor.read_u32::<BigEndian>().ok()?;

    let name = if data.len() > 16 {
        let tail = &data[16..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Some(str::from_utf8(&tail[..end]).ok()?.to_string())
    } else {
        None
    };

    Some(SessionPacketFields {
        protocol_version,
        initiator_token,
        ssrc,
        name,
    })
}

/// Parse a CK packet. Returns `None` when shorter than the 36-byte layout.
pub fn parse_sync_packet(data: &[u8]) -> Option<SyncPacketFields> {
    if data.len() < 36 {
        return None;
    }
    let mut cursor = Cursor::new(&data[4..]);
    let ssrc = cursor.read_u32::<BigEndian>().ok()?;
    let count = cursor.read_u8().ok()?;
    cursor.set_position(cursor.position() + 3);
    let mut timestamps = [0u32; 6];
    for timestamp in timestamps.iter_mut() {
        *timestamp = cursor.read_u32::<BigEndian>().ok()?;
    }
    Some(SyncPacketFields {
        ssrc,
        count,
        timestamps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_detection() {
        assert_eq!(
            packet_type(&[0xFF, 0xFF, b'I', b'N', 0x00]),
            PacketType::IN
        );
        assert_eq!(packet_type(&[0xFF, 0xFF, b'O', b'K']), PacketType::OK);
        assert_eq!(packet_type(&[0xFF, 0xFF, b'N', b'O']), PacketType::NO);
        assert_eq!(packet_type(&[0xFF, 0xFF, b'B', b'Y']), PacketType::BY);
        assert_eq!(packet_type(&[0xFF, 0xFF, b'C', b'K']), PacketType::CK);
        assert_eq!(packet_type(&[0xFF, 0xFF, b'R', b'S']), PacketType::RS);
        assert_eq!(packet_type(&[0xFF, 0xFF, b'X', b'X']), PacketType::Unknown);
        assert_eq!(packet_type(&[0x80, 0x61, b'I', b'N']), PacketType::Unknown);
        assert_eq!(packet_type(&[0xFF, 0xFF]), PacketType::Unknown);
    }

    #[test]
    fn test_invitation_layout() {
        let packet =
            build_session_packet(PacketType::IN, 0xAAAAAAAA, 0x11111111, Some("testing"));
        assert_eq!(
            packet,
            vec![
                0xFF, 0xFF, b'I', b'N', // command in
                0x00, 0x00, 0x00, 0x02, // Version
                0xAA, 0xAA, 0xAA, 0xAA, // Initiator
                0x11, 0x11, 0x11, 0x11, // SSRC
                b't', b'e', b's', b't', b'i', b'n', b'g', 0x00, // The name
            ]
        );
    }

    #[test]
    fn test_by_has_no_name() {
        let packet = build_session_packet(PacketType::BY, 0x12345678, 0xAABBCCDD, None);
        assert_eq!(packet.len(), 16);
        assert_eq!(&packet[0..4], &[0xFF, 0xFF, b'B', b'Y']);
    }

    #[test]
    fn test_empty_name_is_not_appended() {
        let packet = build_session_packet(PacketType::OK, 1, 2, Some(""));
        assert_eq!(packet.len(), 16);
    }

    #[test]
    fn test_session_packet_roundtrip() {
        let packet =
            build_session_packet(PacketType::OK, 0x12345678, 0xAABBCCDD, Some("session"));
        let fields = parse_session_packet(&packet).unwrap();
        assert_eq!(fields.protocol_version, 2);
        assert_eq!(fields.initiator_token, 0x12345678);
        assert_eq!(fields.ssrc, 0xAABBCCDD);
        assert_eq!(fields.name.as_deref(), Some("session"));
    }

    #[test]
    fn test_short_session_packet_is_rejected() {
        assert!(parse_session_packet(&[0xFF, 0xFF, b'I', b'N', 0, 0, 0, 2]).is_none());
    }

    #[test]
    fn test_sync_packet_layout() {
        let packet = build_sync_packet(0x11111111, 1, &[0, 0x1234, 0, 0x5678, 0, 0]);
        assert_eq!(packet.len(), 36);
        assert_eq!(&packet[0..4], &[0xFF, 0xFF, b'C', b'K']);
        assert_eq!(&packet[4..8], &[0x11, 0x11, 0x11, 0x11]);
        assert_eq!(packet[8], 1); // count
        assert_eq!(&packet[9..12], &[0, 0, 0]);
        assert_eq!(&packet[16..20], &[0x00, 0x00, 0x12, 0x34]); // TS1L
        assert_eq!(&packet[24..28], &[0x00, 0x00, 0x56, 0x78]); // TS2L
    }

    #[test]
    fn test_sync_packet_roundtrip() {
        let timestamps = [1, 2, 3, 4, 5, 6];
        let packet = build_sync_packet(0xCAFEBABE, 2, &timestamps);
        let fields = parse_sync_packet(&packet).unwrap();
        assert_eq!(fields.ssrc, 0xCAFEBABE);
        assert_eq!(fields.count, 2);
        assert_eq!(fields.timestamps, timestamps);
    }

    #[test]
    fn test_short_sync_packet_is_rejected() {
        let packet = build_sync_packet(1, 0, &[0; 6]);
        assert!(parse_sync_packet(&packet[..35]).is_none());
    }

    #[test]
    fn test_feedback_layout() {
        let packet = build_feedback_packet(0x11111111, 0x0203);
        assert_eq!(
            packet,
            vec![
                0xFF, 0xFF, b'R', b'S', // receiver feedback
                0x11, 0x11, 0x11, 0x11, // SSRC
                0x02, 0x03, 0x00, 0x00, // last sequence + reserved
            ]
        );
    }

    #[test]
    fn test_midi_datagram_layout() {
        let packet = build_midi_datagram(7, 0x00010203, 0xA1B2C3D4, &[0x90, 0x3C, 0x7F]);
        assert_eq!(packet[0], 0x80); // V=2
        assert_eq!(packet[1], 0x61); // M=1, PT=0x61
        assert_eq!(&packet[2..4], &[0x00, 0x07]); // sequence
        assert_eq!(&packet[4..8], &[0x00, 0x01, 0x02, 0x03]); // timestamp
        assert_eq!(&packet[8..12], &[0xA1, 0xB2, 0xC3, 0xD4]); // SSRC
        assert_eq!(&packet[12..14], &[0x80, 0x03]); // B=1, J=Z=P=0, length 3
        assert_eq!(&packet[14..], &[0x90, 0x3C, 0x7F]);
    }

    #[test]
    fn test_midi_datagram_long_length_field() {
        let midi = vec![0u8; 774];
        let packet = build_midi_datagram(0, 0, 0, &midi);
        // 0x306 = 774 in the low 12 bits, B bit on top
        assert_eq!(&packet[12..14], &[0x83, 0x06]);
        assert_eq!(packet.len(), 14 + 774);
    }
}
