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
//! The session endpoint: both UDP channels, the invitation and clock
//! synchronization state machine, keep-alive, loss detection and teardown.
//!
//! One endpoint talks to one session partner. The host calls [`tick`] from
//! a single thread every millisecond; every socket read is non-blocking
//! and both sockets are drained completely on each tick so packet bursts
//! do not add latency.
//!
//! [`tick`]: RtpMidiSession::tick

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::mididecoder::MidiDecoder;
use crate::midiqueue::{self, EndpointFlags, MidiBlockSender, MidiOutQueue};
use crate::packets::{self, PacketType, MAX_RTP_LOAD, MAX_SESSION_NAME_LEN};

/// Called for every decoded MIDI message with the message bytes and its
/// timestamp (local clock plus delta-time, 100 µs units). Runs on the
/// thread calling `tick()`, keep the work short.
pub type MidiCallback = Box<dyn FnMut(&[u8], u32) + Send>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("can not create control socket: {0}")]
    ControlSocketCreate(#[source] io::Error),
    #[error("can not create data socket: {0}")]
    DataSocketCreate(#[source] io::Error),
}

#[derive(Debug, PartialEq, Copy, Clone)]
enum SessionState {
    Closed,
    /// Initiator, sending invitations on the control port.
    InviteControl,
    /// Initiator, sending invitations on the data port.
    InviteData,
    /// Initiator, about to send the first synchronization message.
    ClockSync0,
    /// Initiator, waiting for the CK answer from the remote node.
    ClockSync1,
    Opened,
    /// Listener, waiting to be invited on the control port.
    WaitInviteControl,
    /// Listener, invitation accepted on control, waiting for the data one.
    WaitInviteData,
    /// Listener, waiting for CK count=2 to confirm the session.
    WaitClockSync,
}

/// Coarse session status as reported to the host.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SessionStatus {
    Closed,
    Inviting,
    Syncing,
    Opened,
}

/// Countdown armed by the state machine, serviced once per tick.
#[derive(Debug)]
struct TickTimer {
    running: bool,
    remaining_ms: u32,
}

impl TickTimer {
    fn new() -> TickTimer {
        TickTimer {
            running: false,
            remaining_ms: 0,
        }
    }

    fn arm(&mut self, time_to_wait_ms: u32) {
        self.running = false;
        self.remaining_ms = time_to_wait_ms;
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    /// Count one millisecond down. True exactly once, when the countdown
    /// reaches zero.
    fn advance(&mut self) -> bool {
        if !self.running {
            return false;
        }
        if self.remaining_ms > 0 {
            self.remaining_ms -= 1;
        }
        if self.remaining_ms == 0 {
            self.running = false;
            return true;
        }
        false
    }
}

pub struct RtpMidiSession {
    callback: Option<MidiCallback>,
    session_name: String,

    /// Address given to `initiate`, re-targeted on every restart.
    remote_ip_to_invite: Ipv4Addr,
    /// Bound partner. Gates everything received on the data socket.
    partner_ip: Option<IpAddr>,
    partner_control_port: u16,
    partner_data_port: u16,

    control_socket: Option<UdpSocket>,
    data_socket: Option<UdpSocket>,

    flags: Arc<EndpointFlags>,
    ssrc: u32,
    initiator_token: u32,
    rtp_sequence: u16,
    /// Last sequence number received from the session partner.
    last_rtp_counter: u16,
    /// Last sequence number acknowledged in an RS packet.
    last_feedback_counter: u16,
    state: SessionState,
    invite_count: u32,
    is_initiator: bool,
    /// Decremented on every keep-alive slot, reloaded by received CK.
    timeout_remote: u32,
    sync_sequence_counter: u32,
    measured_latency: u32,

    timer: TickTimer,
    /// Free-running counter in 100 µs units, +10 per tick.
    clock: u32,
    /// TS1H, TS1L, TS2H, TS2L, TS3H, TS3L of the current sync exchange.
    sync_timestamps: [u32; 6],

    queue: MidiOutQueue,
    sender: Option<MidiBlockSender>,
    decoder: MidiDecoder,
}

impl RtpMidiSession {
    /// `sysex_in_size` bounds incoming SysEx reassembly. Without a
    /// callback, decoded MIDI is dropped.
    pub fn new(sysex_in_size: usize, callback: Option<MidiCallback>) -> RtpMidiSession {
        let flags = Arc::new(EndpointFlags::default());
        flags.locked.store(true, Ordering::Release);
        let (sender, queue) = midiqueue::midi_out_queue(Arc::clone(&flags));

        RtpMidiSession {
            callback,
            session_name: String::new(),
            remote_ip_to_invite: Ipv4Addr::UNSPECIFIED,
            partner_ip: None,
            partner_control_port: 0,
            partner_data_port: 0,
            control_socket: None,
            data_socket: None,
            flags,
            ssrc: 0,
            initiator_token: 0,
            rtp_sequence: 0,
            last_rtp_counter: 0,
            last_feedback_counter: 0,
            state: SessionState::Closed,
            invite_count: 0,
            is_initiator: true,
            timeout_remote: 4,
            sync_sequence_counter: 0,
            measured_latency: u32::MAX,
            timer: TickTimer::new(),
            clock: 0,
            sync_timestamps: [0; 6],
            queue,
            sender: Some(sender),
            decoder: MidiDecoder::new(sysex_in_size),
        }
    }

    /// Record a session name. Shall be called before `initiate`. Names
    /// longer than 63 bytes are not recorded.
    pub fn set_session_name(&mut self, name: &str) {
        if name.len() > MAX_SESSION_NAME_LEN {
            return;
        }
        self.session_name = name.to_string();
    }

    /// Swap the decoded-MIDI callback. The endpoint is locked across the
    /// swap so a concurrent tick does not deliver into a half-configured
    /// callback.
    pub fn set_callback(&mut self, callback: Option<MidiCallback>) {
        let was_locked = self.flags.locked.swap(true, Ordering::AcqRel);
        self.callback = callback;
        self.flags.locked.store(was_locked, Ordering::Release);
    }

    /// Open both UDP sockets and start the session process.
    ///
    /// A local port of 0 lets the OS choose; a zero data port is first
    /// requested as control port + 1. As initiator the endpoint starts
    /// inviting `remote_ip` immediately, as listener it waits to be
    /// invited and the remote address arguments are unused.
    pub fn initiate(
        &mut self,
        remote_ip: Ipv4Addr,
        remote_control_port: u16,
        remote_data_port: u16,
        local_control_port: u16,
        local_data_port: u16,
        is_initiator: bool,
    ) -> Result<(), SessionError> {
        self.remote_ip_to_invite = remote_ip;
        self.partner_control_port = remote_control_port;
        self.partner_data_port = remote_data_port;

        self.initiator_token = rand::random::<u32>();
        self.ssrc = rand::random::<u32>();
        self.rtp_sequence = 0;
        self.last_rtp_counter = 0;
        self.last_feedback_counter = 0;
        self.sync_sequence_counter = 0;
        self.measured_latency = u32::MAX;

        self.close_sockets();

        let control_socket =
            Self::create_udp_socket(local_control_port).map_err(SessionError::ControlSocketCreate)?;
        let control_port = control_socket
            .local_addr()
            .map_err(SessionError::ControlSocketCreate)?
            .port();
        let data_socket = if local_data_port == 0 {
            Self::create_udp_socket(control_port.wrapping_add(1))
                .or_else(|_| Self::create_udp_socket(0))
        } else {
            Self::create_udp_socket(local_data_port)
        }
        .map_err(SessionError::DataSocketCreate)?;
        self.control_socket = Some(control_socket);
        self.data_socket = Some(data_socket);

        self.decoder.reset();
        self.flags.connection_lost.store(false, Ordering::Release);
        self.invite_count = 0;
        // 120 seconds: five sync sequences every 1.5 seconds then one
        // every 10 seconds = 5 + 11
        self.timeout_remote = 16;
        self.is_initiator = is_initiator;
        if is_initiator {
            self.set_state(SessionState::InviteControl);
            self.partner_ip = Some(IpAddr::V4(remote_ip));
            info!(
                "Initiating session with {}:{}/{}",
                remote_ip, remote_control_port, remote_data_port
            );
        } else {
            self.set_state(SessionState::WaitInviteControl);
            self.partner_ip = None;
            info!("Listening for session invitations");
        }
        self.timer.arm(1);
        // Must be the last step of session initialization
        self.flags.locked.store(false, Ordering::Release);
        Ok(())
    }

    /// Close the session, sending BY to the partner when one was ever
    /// engaged. Blocks for ~50 ms so the datagram leaves before the
    /// sockets do.
    pub fn close(&mut self) {
        // An idle listener has no partner to notify and keeps listening
        if !self.is_initiator && self.state == SessionState::WaitInviteControl {
            return;
        }
        if self.flags.locked.load(Ordering::Acquire) {
            return;
        }

        self.set_state(SessionState::Closed);
        self.flags.locked.store(true, Ordering::Release);
        self.send_by_command();
        thread::sleep(Duration::from_millis(50));
        self.close_sockets();
    }

    /// Restart the session process after it was closed by the remote
    /// partner. Only meaningful for a session initiator.
    pub fn restart_session(&mut self) {
        if !self.is_initiator {
            return;
        }

        self.decoder.reset();
        self.invite_count = 0;
        self.timeout_remote = 16;
        self.partner_ip = Some(IpAddr::V4(self.remote_ip_to_invite));
        self.set_state(SessionState::InviteControl);
        self.timer.arm(1000);
    }

    /// Queue MIDI bytes (with leading delta-times) for transmission.
    /// False when the session is not opened, the block does not fit, or
    /// the producer handle was taken with `take_sender`.
    pub fn send_midi_block(&mut self, block: &[u8]) -> bool {
        match self.sender.as_mut() {
            Some(sender) => sender.send_midi_block(block),
            None => false,
        }
    }

    /// Detach the producer half of the outbound queue so another thread
    /// can feed MIDI while this thread keeps ticking. Can be taken once.
    pub fn take_sender(&mut self) -> Option<MidiBlockSender> {
        self.sender.take()
    }

    pub fn status(&self) -> SessionStatus {
        match self.state {
            SessionState::Closed => SessionStatus::Closed,
            SessionState::Opened => SessionStatus::Opened,
            SessionState::InviteControl | SessionState::InviteData => SessionStatus::Inviting,
            _ => SessionStatus::Syncing,
        }
    }

    /// Measured latency in 100 µs units, `u32::MAX` while unknown.
    pub fn latency(&self) -> u32 {
        if self.state != SessionState::Opened {
            return u32::MAX;
        }
        self.measured_latency
    }

    /// The locally bound (control, data) ports, once `initiate` succeeded.
    pub fn local_ports(&self) -> Option<(u16, u16)> {
        let control = self.control_socket.as_ref()?.local_addr().ok()?.port();
        let data = self.data_socket.as_ref()?.local_addr().ok()?.port();
        Some((control, data))
    }

    /// True when an incoming SysEx had to be truncated. Clears with the
    /// next SysEx start.
    pub fn sysex_overflow(&self) -> bool {
        self.decoder.sysex_overflowed()
    }

    /// True once after the remote node stopped answering keep-alive.
    pub fn connection_lost(&self) -> bool {
        self.flags.connection_lost.swap(false, Ordering::AcqRel)
    }

    /// True once after the remote participant sent BY.
    pub fn peer_closed(&self) -> bool {
        self.flags.peer_closed.swap(false, Ordering::AcqRel)
    }

    /// True once after the remote participant rejected the invitation.
    pub fn peer_refused(&self) -> bool {
        self.flags.peer_refused.swap(false, Ordering::AcqRel)
    }

    /// Main processing function, to be called from a high priority timer
    /// every millisecond. Never blocks.
    pub fn tick(&mut self) {
        self.clock = self.clock.wrapping_add(10);

        if self.flags.locked.load(Ordering::Acquire) {
            return;
        }

        let timer_event = self.timer.advance();

        // A listener whose invitation or synchronization did not complete
        // in time goes back to waiting
        if timer_event
            && (self.state == SessionState::WaitInviteData
                || self.state == SessionState::WaitClockSync)
        {
            debug!("Invitation process timed out, listening again");
            self.set_state(SessionState::WaitInviteControl);
        }

        let mut accepted_on_control = false;
        let mut rejected_on_control = false;
        let mut accepted_on_data = false;
        let mut rejected_on_data = false;

        // Flush both sockets completely, a burst must not stretch over
        // several milliseconds of ticks
        loop {
            let received_on_control =
                self.poll_control_socket(&mut accepted_on_control, &mut rejected_on_control);
            let received_on_data =
                self.poll_data_socket(&mut accepted_on_data, &mut rejected_on_data);
            if !received_on_control && !received_on_data {
                break;
            }
        }

        if rejected_on_control || rejected_on_data {
            warn!("Remote node rejected the session invitation");
            self.timer.stop();
            if self.is_initiator {
                self.set_state(SessionState::Closed);
            } else {
                self.set_state(SessionState::WaitInviteControl);
            }
            self.flags.peer_refused.store(true, Ordering::Release);
            self.partner_ip = None;
            // In case we also got an acceptance this tick, NO wins
            accepted_on_control = false;
            accepted_on_data = false;
        }

        if self.is_initiator {
            match self.state {
                SessionState::InviteControl => {
                    self.sync_sequence_counter = 0;
                    if accepted_on_control {
                        debug!("Invitation accepted on control port");
                        self.set_state(SessionState::InviteData);
                        self.send_invitation(false);
                        self.timer.arm(100);
                        return;
                    } else if timer_event {
                        // Previous attempt timed out, keep inviting
                        self.send_invitation(true);
                        self.timer.arm(1000);
                        self.invite_count += 1;
                    }
                }
                SessionState::InviteData => {
                    if accepted_on_data {
                        debug!("Invitation accepted on data port");
                        self.set_state(SessionState::ClockSync0);
                    } else if timer_event {
                        if self.invite_count > 12 {
                            // No answer after 12 attempts, go back to
                            // inviting on the control port
                            self.restart_session();
                            return;
                        } else {
                            self.send_invitation(false);
                            self.timer.arm(1000);
                            self.invite_count += 1;
                            return;
                        }
                    }
                }
                SessionState::ClockSync0 => {
                    self.send_sync_packet(0, [0, self.clock, 0, 0, 0, 0]);
                    self.set_state(SessionState::ClockSync1);
                }
                _ => {}
            }
        }

        if self.state == SessionState::Opened {
            // At most one data packet per tick
            let mut payload = [0u8; MAX_RTP_LOAD];
            let size = self.queue.drain_into(&mut payload);
            if size > 0 {
                let datagram = packets::build_midi_datagram(
                    self.rtp_sequence,
                    self.clock,
                    self.ssrc,
                    &payload[..size],
                );
                if let Some(addr) = self.partner_data_addr() {
                    self.send_on_data_socket(&datagram, addr);
                }
                self.rtp_sequence = self.rtp_sequence.wrapping_add(1);
            }

            if timer_event {
                // Only acknowledge when something arrived meanwhile, an
                // RS out of the blue crashes the Apple driver
                if self.last_rtp_counter != self.last_feedback_counter {
                    self.send_feedback_packet(self.last_rtp_counter);
                    self.last_feedback_counter = self.last_rtp_counter;
                }

                if self.is_initiator {
                    // Restart a synchronization sequence
                    self.send_sync_packet(0, [0, self.clock, 0, 0, 0, 0]);
                }

                // Five sync sequences every 1.5 seconds after opening,
                // then one every 10 seconds
                if self.sync_sequence_counter <= 5 {
                    self.timer.arm(1500);
                    self.sync_sequence_counter += 1;
                } else {
                    self.timer.arm(10000);
                }
                if self.timeout_remote > 0 {
                    self.timeout_remote -= 1;
                }
            }

            if self.timeout_remote == 0 {
                // Remote node disconnected without sending BY
                warn!("Remote node does not answer to keep-alive, connection lost");
                self.flags.connection_lost.store(true, Ordering::Release);
                if self.is_initiator {
                    self.timeout_remote = 4;
                    self.restart_session();
                } else {
                    self.set_state(SessionState::WaitInviteControl);
                }
            }
        }
    }

    fn create_udp_socket(port: u16) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    fn close_sockets(&mut self) {
        self.control_socket = None;
        self.data_socket = None;
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.flags
            .opened
            .store(state == SessionState::Opened, Ordering::Release);
    }

    fn partner_control_addr(&self) -> Option<SocketAddr> {
        self.partner_ip
            .map(|ip| SocketAddr::new(ip, self.partner_control_port))
    }

    fn partner_data_addr(&self) -> Option<SocketAddr> {
        self.partner_ip
            .map(|ip| SocketAddr::new(ip, self.partner_data_port))
    }

    fn session_name_field(&self) -> Option<&str> {
        if self.session_name.is_empty() {
            None
        } else {
            Some(self.session_name.as_str())
        }
    }

    /// Best effort: UDP send errors on an established flow are logged and
    /// otherwise ignored.
    fn send_on_control_socket(&self, payload: &[u8], destination: SocketAddr) {
        if let Some(socket) = &self.control_socket {
            if let Err(error) = socket.send_to(payload, destination) {
                debug!("Send on control socket to {} failed: {}", destination, error);
            }
        }
    }

    fn send_on_data_socket(&self, payload: &[u8], destination: SocketAddr) {
        if let Some(socket) = &self.data_socket {
            if let Err(error) = socket.send_to(payload, destination) {
                debug!("Send on data socket to {} failed: {}", destination, error);
            }
        }
    }

    fn send_invitation(&mut self, to_control: bool) {
        let packet = packets::build_session_packet(
            PacketType::IN,
            self.initiator_token,
            self.ssrc,
            self.session_name_field(),
        );
        if to_control {
            if let Some(addr) = self.partner_control_addr() {
                debug!("Send IN to control {}", addr);
                self.send_on_control_socket(&packet, addr);
            }
        } else if let Some(addr) = self.partner_data_addr() {
            debug!("Send IN to data {}", addr);
            self.send_on_data_socket(&packet, addr);
        }
    }

    fn send_invitation_reply(&mut self, on_control: bool, accept: bool, destination: SocketAddr) {
        let command = if accept { PacketType::OK } else { PacketType::NO };
        let packet = packets::build_session_packet(
            command,
            self.initiator_token,
            self.ssrc,
            self.session_name_field(),
        );
        debug!("Send {:?} to {}", command, destination);
        if on_control {
            self.send_on_control_socket(&packet, destination);
        } else {
            self.send_on_data_socket(&packet, destination);
        }
    }

    fn send_by_command(&mut self) {
        let packet =
            packets::build_session_packet(PacketType::BY, self.initiator_token, self.ssrc, None);
        if let Some(addr) = self.partner_control_addr() {
            debug!("Send BY to {}", addr);
            self.send_on_control_socket(&packet, addr);
        }
    }

    fn send_sync_packet(&mut self, count: u8, timestamps: [u32; 6]) {
        let packet = packets::build_sync_packet(self.ssrc, count, &timestamps);
        if let Some(addr) = self.partner_data_addr() {
            self.send_on_data_socket(&packet, addr);
        }
    }

    fn send_feedback_packet(&mut self, sequence: u16) {
        let packet = packets::build_feedback_packet(self.ssrc, sequence);
        if let Some(addr) = self.partner_control_addr() {
            debug!("Send RS for sequence {} to {}", sequence, addr);
            self.send_on_control_socket(&packet, addr);
        }
    }

    /// Remote partner has asked to close the session.
    fn partner_close_session(&mut self) {
        info!("Session closed by remote partner");
        self.timer.stop();
        if self.is_initiator {
            self.set_state(SessionState::Closed);
        } else {
            self.set_state(SessionState::WaitInviteControl);
        }
        self.flags.peer_closed.store(true, Ordering::Release);
        self.partner_ip = None;
    }

    /// Process one pending datagram on the control socket, where the
    /// invitations arrive. True when a packet was consumed.
    fn poll_control_socket(&mut self, accepted: &mut bool, rejected: &mut bool) -> bool {
        let mut buffer = [0u8; 1500];
        let (size, sender) = {
            let socket = match self.control_socket.as_ref() {
                Some(socket) => socket,
                None => return false,
            };
            match socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return false,
                Err(_) => return false,
            }
        };
        if size == 0 {
            return false;
        }
        let data = &buffer[..size];

        // Ignore everything that is not an Apple session message
        match packets::packet_type(data) {
            PacketType::IN => {
                if self.is_initiator {
                    // An initiator does not accept invitations
                    return true;
                }
                if self.state == SessionState::WaitInviteControl {
                    let fields = match packets::parse_session_packet(data) {
                        Some(fields) => fields,
                        None => return true,
                    };
                    info!(
                        "Invited by {} (token {:08X}, name {:?})",
                        sender,
                        fields.initiator_token,
                        fields.name.as_deref().unwrap_or("")
                    );
                    self.initiator_token = fields.initiator_token;
                    self.set_state(SessionState::WaitInviteData);
                    self.timer.arm(5000);
                    self.send_invitation_reply(true, true, sender);
                    self.partner_ip = Some(sender.ip());
                    self.partner_control_port = sender.port();
                } else if Some(sender.ip()) == self.partner_ip
                    && sender.port() == self.partner_control_port
                {
                    // A repetition of the invitation we already accepted
                    self.timer.arm(5000);
                    self.send_invitation_reply(true, true, sender);
                } else {
                    // Another node inviting while we are engaged
                    self.send_invitation_reply(true, false, sender);
                }
            }
            PacketType::OK => {
                *accepted = true;
            }
            PacketType::NO => {
                *rejected = true;
            }
            PacketType::BY => {
                // Only the connected partner may close the session
                if Some(sender.ip()) == self.partner_ip {
                    self.partner_close_session();
                }
            }
            _ => {}
        }
        true
    }

    /// Process one pending datagram on the data socket: RTP-MIDI media,
    /// clock synchronization and the data leg of the invitation. True
    /// when a packet was consumed.
    fn poll_data_socket(&mut self, accepted: &mut bool, rejected: &mut bool) -> bool {
        let mut buffer = [0u8; 1500];
        let (size, sender) = {
            let socket = match self.data_socket.as_ref() {
                Some(socket) => socket,
                None => return false,
            };
            match socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return false,
                Err(_) => return false,
            }
        };
        if size < 2 {
            return true;
        }
        // Only the session partner may talk on the data channel
        if Some(sender.ip()) != self.partner_ip {
            return true;
        }
        let data = &buffer[..size];

        if data[0] == 0x80 && data[1] == 0x61 {
            if self.state == SessionState::Opened {
                self.process_incoming_rtp(data);
            }
            return true;
        }

        match packets::packet_type(data) {
            PacketType::CK => {
                if let Some(sync) = packets::parse_sync_packet(data) {
                    self.process_clock_sync(sync);
                }
            }
            PacketType::IN => {
                if !self.is_initiator {
                    // The initiator confirms on the data port, accept even
                    // if our own invitation timer is still pending
                    debug!("Invited on data port by {}", sender);
                    self.set_state(SessionState::WaitClockSync);
                    self.timer.arm(2000);
                    self.send_invitation_reply(false, true, sender);
                    self.partner_data_port = sender.port();
                }
            }
            PacketType::OK => {
                *accepted = true;
            }
            PacketType::NO => {
                *rejected = true;
            }
            PacketType::BY => {
                self.partner_close_session();
            }
            _ => {}
        }
        true
    }

    /// The three message clock handshake. Count 0 is answered with our
    /// clock, count 1 closes our own measurement and confirms with count
    /// 2, count 2 confirms the listener side.
    fn process_clock_sync(&mut self, sync: packets::SyncPacketFields) {
        // Any CK from the partner proves it is alive
        self.timeout_remote = 4;

        match sync.count {
            0 => {
                self.sync_timestamps[0] = sync.timestamps[0];
                self.sync_timestamps[1] = sync.timestamps[1];
                self.send_sync_packet(
                    1,
                    [
                        self.sync_timestamps[0],
                        self.sync_timestamps[1],
                        0,
                        self.clock,
                        0,
                        0,
                    ],
                );
            }
            1 => {
                self.sync_timestamps[..4].copy_from_slice(&sync.timestamps[..4]);
                self.measured_latency = self.clock.wrapping_sub(self.sync_timestamps[1]);
                debug!("Measured latency {} x100us", self.measured_latency);
                self.send_sync_packet(
                    2,
                    [
                        self.sync_timestamps[0],
                        self.sync_timestamps[1],
                        self.sync_timestamps[2],
                        self.sync_timestamps[3],
                        0,
                        self.clock,
                    ],
                );
                if self.is_initiator && self.state == SessionState::ClockSync1 {
                    info!("Session opened, latency {} x100us", self.measured_latency);
                    self.set_state(SessionState::Opened);
                    // Start the keep-alive chain on the next tick
                    self.timer.arm(1);
                }
            }
            2 => {
                self.sync_timestamps = sync.timestamps;
                self.measured_latency = self.clock.wrapping_sub(self.sync_timestamps[3]);
                if self.state != SessionState::Opened {
                    info!("Session opened, latency {} x100us", self.measured_latency);
                    self.set_state(SessionState::Opened);
                    self.timer.arm(1);
                }
            }
            _ => {
                debug!("Invalid CK count {}", sync.count);
            }
        }
    }

    /// Decode one RTP-MIDI datagram and deliver its messages.
    fn process_incoming_rtp(&mut self, datagram: &[u8]) {
        let clock = self.clock;
        let callback = &mut self.callback;
        let sequence = self
            .decoder
            .decode_datagram(datagram, clock, &mut |bytes, timestamp| {
                if let Some(callback) = callback.as_mut() {
                    callback(bytes, timestamp);
                }
            });
        if let Some(sequence) = sequence {
            self.last_rtp_counter = sequence;
        }
    }
}
