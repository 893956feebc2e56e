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

//! A single endpoint of the Apple RTP-MIDI session protocol.
//!
//! The endpoint owns two UDP sockets (control and data), runs the
//! invitation and clock-synchronization state machine against one session
//! partner, and transports MIDI 1.0 byte streams as RTP payload type 0x61.
//! The host drives everything by calling [`RtpMidiSession::tick`] every
//! millisecond from a single thread; nothing here blocks except the short
//! teardown drain in [`RtpMidiSession::close`].

#[macro_use]
extern crate log;

pub mod mididecoder;
pub mod midiqueue;
pub mod packets;
pub mod session;

pub use mididecoder::{encode_delta_time, MidiDecoder};
pub use midiqueue::MidiBlockSender;
pub use session::{MidiCallback, RtpMidiSession, SessionError, SessionStatus};

use log::LevelFilter;
use std::io::Write;

/// Session traffic is traced at millisecond granularity, so the log stamp
/// carries milliseconds too. Safe to call more than once.
pub fn setup_logging() {
    let level = if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = env_logger::builder()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}: {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}
