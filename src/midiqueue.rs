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
//! Outbound MIDI byte ring between the application and the RTP encoder.
//!
//! Single producer, single consumer: the producer half can move to another
//! thread as a [`MidiBlockSender`], the consumer half stays inside the
//! session and is drained once per tick. Blocks are published atomically,
//! a block that does not fit leaves the ring untouched.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};

/// Capacity of the outbound ring in bytes.
pub const MIDI_STREAM_FIFO_SIZE: usize = 2048;

/// State shared between the session thread and a detached producer,
/// plain atomic reads and writes only.
#[derive(Debug, Default)]
pub struct EndpointFlags {
    pub locked: AtomicBool,
    pub opened: AtomicBool,
    pub connection_lost: AtomicBool,
    pub peer_closed: AtomicBool,
    pub peer_refused: AtomicBool,
}

/// Producer half of the outbound ring. May live on a different thread
/// than the session driving `tick()`.
pub struct MidiBlockSender {
    tx: Producer<u8>,
    flags: Arc<EndpointFlags>,
}

/// Consumer half, owned by the session.
pub struct MidiOutQueue {
    rx: Consumer<u8>,
}

pub fn midi_out_queue(flags: Arc<EndpointFlags>) -> (MidiBlockSender, MidiOutQueue) {
    let (tx, rx) = RingBuffer::new(MIDI_STREAM_FIFO_SIZE);
    (MidiBlockSender { tx, flags }, MidiOutQueue { rx })
}

impl MidiBlockSender {
    /// Queue a block of MIDI bytes (with leading delta-times) for the next
    /// transmission slot. All or nothing: returns false without touching
    /// the ring when the session is not opened or the block does not fit.
    pub fn send_midi_block(&mut self, block: &[u8]) -> bool {
        if block.is_empty() {
            return true;
        }
        if !self.flags.opened.load(std::sync::atomic::Ordering::Acquire) {
            return false;
        }
        match self.tx.write_chunk_uninit(block.len()) {
            Ok(chunk) => {
                chunk.fill_from_iter(block.iter().copied());
                true
            }
            Err(_) => false,
        }
    }
}

impl MidiOutQueue {
    /// Move up to `out.len()` queued bytes into `out`, returning how many
    /// were written. The write position is read once as a snapshot, bytes
    /// queued concurrently wait for the next drain.
    pub fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let size = self.rx.slots().min(out.len());
        if size == 0 {
            return 0;
        }
        match self.rx.read_chunk(size) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                out[..first.len()].copy_from_slice(first);
                out[first.len()..first.len() + second.len()].copy_from_slice(second);
                chunk.commit_all();
                size
            }
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn opened_queue() -> (MidiBlockSender, MidiOutQueue) {
        let flags = Arc::new(EndpointFlags::default());
        flags.opened.store(true, Ordering::Release);
        midi_out_queue(flags)
    }

    #[test]
    fn test_blocks_preserve_order() {
        let (mut sender, mut queue) = opened_queue();
        assert!(sender.send_midi_block(&[0x00, 0x90, 0x3C, 0x7F]));
        assert!(sender.send_midi_block(&[0x00, 0x80, 0x3C, 0x00]));

        let mut out = [0u8; 16];
        let size = queue.drain_into(&mut out);
        assert_eq!(size, 8);
        assert_eq!(&out[..8], &[0x00, 0x90, 0x3C, 0x7F, 0x00, 0x80, 0x3C, 0x00]);
    }

    #[test]
    fn test_empty_block_is_a_noop() {
        let (mut sender, mut queue) = opened_queue();
        assert!(sender.send_midi_block(&[]));
        assert_eq!(queue.drain_into(&mut [0u8; 8]), 0);
    }

    #[test]
    fn test_rejected_when_not_opened() {
        let flags = Arc::new(EndpointFlags::default());
        let (mut sender, mut queue) = midi_out_queue(flags);
        assert!(!sender.send_midi_block(&[0x00, 0xF6]));
        assert_eq!(queue.drain_into(&mut [0u8; 8]), 0);
    }

    #[test]
    fn test_full_ring_rejects_block_atomically() {
        let (mut sender, mut queue) = opened_queue();
        let big = vec![0x11u8; MIDI_STREAM_FIFO_SIZE - 10];
        assert!(sender.send_midi_block(&big));
        // 11 bytes can not fit in the 10 remaining slots
        assert!(!sender.send_midi_block(&[0x22; 11]));
        // but 10 still can
        assert!(sender.send_midi_block(&[0x33; 10]));

        let mut out = vec![0u8; MIDI_STREAM_FIFO_SIZE];
        let size = queue.drain_into(&mut out);
        assert_eq!(size, MIDI_STREAM_FIFO_SIZE);
        assert!(out[..MIDI_STREAM_FIFO_SIZE - 10].iter().all(|&b| b == 0x11));
        assert!(out[MIDI_STREAM_FIFO_SIZE - 10..].iter().all(|&b| b == 0x33));
    }

    #[test]
    fn test_drain_is_bounded_by_output_buffer() {
        let (mut sender, mut queue) = opened_queue();
        assert!(sender.send_midi_block(&[0x55; 100]));
        let mut out = [0u8; 64];
        assert_eq!(queue.drain_into(&mut out), 64);
        assert_eq!(queue.drain_into(&mut out), 36);
    }
}
