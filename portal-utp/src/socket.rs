//! Per-connection uTP state machine.
//!
//! A socket is either the READ end (sink) or the WRITE end (source) of one
//! content transfer. It is sans-io: `handle_packet` and `on_tick` consume an
//! explicit `now` plus the wire microsecond clock and return the packets to
//! put on the wire; observable outcomes surface through `poll_event`.

use crate::PAYLOAD_SIZE;
use crate::congestion::Ledbat;
use crate::error::{UtpError, UtpResult};
use crate::framing::FrameDecoder;
use crate::packet::{Packet, PacketType, SelectiveAck};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Hard cap on out-of-order packets buffered by a READ socket. Beyond this
/// the peer is either broken or hostile and the connection resets.
pub const MAX_RECV_BUFFER_PACKETS: usize = 1024;

/// Receive window advertised while the reassembly buffer is empty.
pub const RECV_WINDOW: u32 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    /// Sink: reassembles incoming DATA into content.
    Read,
    /// Source: chunks content into outgoing DATA.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    SynSent,
    SynRecv,
    Connected,
    /// FIN seen but earlier sequence numbers are still missing.
    GotFin,
    Closed,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    PeerReset,
    Timeout,
    BufferOverflow,
    ProtocolViolation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Connected,
    /// One item of a framed batch transfer completed (READ, framed mode).
    Frame(Vec<u8>),
    /// The whole transfer completed (READ, unframed mode).
    Delivered(Vec<u8>),
    /// Clean shutdown; for WRITE sockets this means everything was acked.
    Closed,
    Reset(ResetReason),
}

/// `a <= b` under sequence-number wrap-around.
fn seq_le(a: u16, b: u16) -> bool {
    b.wrapping_sub(a) < 0x8000
}

#[derive(Debug)]
struct OutPacket {
    payload: Vec<u8>,
    is_fin: bool,
    transmissions: u32,
    last_sent_at: Instant,
}

#[derive(Debug)]
pub struct UtpSocket {
    role: SocketRole,
    state: SocketState,
    framed: bool,
    /// Connection id we expect on incoming packets.
    rcv_conn_id: u16,
    /// Connection id we stamp on outgoing packets.
    snd_conn_id: u16,
    /// Next sequence number to assign to an outgoing SYN/DATA/FIN.
    seq_nr: u16,
    /// Highest contiguous sequence number received from the peer.
    ack_nr: u16,
    fin_nr: Option<u16>,
    peer_seq_seeded: bool,
    /// Sequence number our handshake packet carried; repeated verbatim when
    /// the peer retransmits its SYN.
    initial_send_seq: u16,

    // WRITE side
    chunks: VecDeque<Vec<u8>>,
    out_buffer: BTreeMap<u16, OutPacket>,
    in_flight_order: VecDeque<u16>,
    fin_seq: Option<u16>,
    syn_packet: Option<Packet>,

    // READ side
    recv_buffer: BTreeMap<u16, Vec<u8>>,
    content: Vec<u8>,
    frames: FrameDecoder,

    congestion: Ledbat,
    last_activity: Instant,
    peer_window: u32,
    events: VecDeque<SocketEvent>,
}

impl UtpSocket {
    /// Opens a connection as the content sink. `conn_id` is the value
    /// advertised by the peer (CONTENT connection-id); we receive on it and
    /// send on `conn_id + 1`.
    pub fn initiate_read(conn_id: u16, framed: bool, now: Instant, now_micros: u32) -> (Self, Packet) {
        Self::initiate(SocketRole::Read, conn_id, framed, Vec::new(), now, now_micros)
    }

    /// Opens a connection as the content source. `content` is the full byte
    /// stream to transmit (already framed when it carries a batch).
    pub fn initiate_write(
        conn_id: u16,
        content: Vec<u8>,
        now: Instant,
        now_micros: u32,
    ) -> (Self, Packet) {
        Self::initiate(SocketRole::Write, conn_id, false, content, now, now_micros)
    }

    fn initiate(
        role: SocketRole,
        conn_id: u16,
        framed: bool,
        content: Vec<u8>,
        now: Instant,
        now_micros: u32,
    ) -> (Self, Packet) {
        let mut socket = Self::raw(role, conn_id, conn_id.wrapping_add(1), framed, now);
        socket.seq_nr = 1;
        socket.initial_send_seq = 1;
        socket.state = SocketState::SynSent;
        socket.load_content(content);
        let syn = Packet {
            ptype: PacketType::Syn,
            // A SYN advertises the sender's receive id, not its send id.
            connection_id: conn_id,
            timestamp_micros: now_micros,
            timestamp_diff_micros: 0,
            wnd_size: socket.advertised_window(),
            seq_nr: socket.seq_nr,
            ack_nr: 0,
            selective_ack: None,
            payload: Vec::new(),
        };
        socket.seq_nr = socket.seq_nr.wrapping_add(1);
        socket.syn_packet = Some(syn.clone());
        (socket, syn)
    }

    /// Accepts an inbound SYN as the content sink.
    pub fn accept_read(
        syn: &Packet,
        framed: bool,
        now: Instant,
        now_micros: u32,
        rng: &mut dyn rand::RngCore,
    ) -> (Self, Packet) {
        let mut socket = Self::raw(
            SocketRole::Read,
            syn.connection_id.wrapping_add(1),
            syn.connection_id,
            framed,
            now,
        );
        socket.seq_nr = (rng.next_u32() & 0xffff) as u16;
        socket.initial_send_seq = socket.seq_nr;
        socket.ack_nr = syn.seq_nr;
        socket.peer_seq_seeded = true;
        socket.state = SocketState::Connected;
        socket.events.push_back(SocketEvent::Connected);
        let syn_ack = socket.make_state(now_micros, syn.timestamp_micros);
        (socket, syn_ack)
    }

    /// Accepts an inbound SYN as the content source. Returns the SYN-ACK;
    /// the first DATA packets follow from the same call's `fill` output.
    pub fn accept_write(
        syn: &Packet,
        content: Vec<u8>,
        now: Instant,
        now_micros: u32,
        rng: &mut dyn rand::RngCore,
    ) -> (Self, Vec<Packet>) {
        let mut socket = Self::raw(
            SocketRole::Write,
            syn.connection_id.wrapping_add(1),
            syn.connection_id,
            false,
            now,
        );
        socket.ack_nr = syn.seq_nr;
        socket.peer_seq_seeded = true;
        socket.peer_window = syn.wnd_size;
        socket.load_content(content);
        // The writer picks a random sequence seed; DATA starts just past it.
        socket.seq_nr = (rng.next_u32() & 0xffff) as u16;
        socket.initial_send_seq = socket.seq_nr;
        let syn_ack = socket.make_state(now_micros, syn.timestamp_micros);
        socket.seq_nr = socket.seq_nr.wrapping_add(1);
        socket.state = SocketState::Connected;
        socket.events.push_back(SocketEvent::Connected);
        let mut packets = vec![syn_ack];
        packets.extend(socket.fill_window(now, now_micros));
        (socket, packets)
    }

    fn raw(role: SocketRole, rcv: u16, snd: u16, framed: bool, now: Instant) -> Self {
        Self {
            role,
            state: SocketState::SynRecv,
            framed,
            rcv_conn_id: rcv,
            snd_conn_id: snd,
            seq_nr: 0,
            ack_nr: 0,
            fin_nr: None,
            peer_seq_seeded: false,
            initial_send_seq: 0,
            chunks: VecDeque::new(),
            out_buffer: BTreeMap::new(),
            in_flight_order: VecDeque::new(),
            fin_seq: None,
            syn_packet: None,
            recv_buffer: BTreeMap::new(),
            content: Vec::new(),
            frames: FrameDecoder::new(),
            congestion: Ledbat::new(now),
            last_activity: now,
            peer_window: RECV_WINDOW,
            events: VecDeque::new(),
        }
    }

    fn load_content(&mut self, content: Vec<u8>) {
        for chunk in content.chunks(PAYLOAD_SIZE) {
            self.chunks.push_back(chunk.to_vec());
        }
    }

    pub fn role(&self) -> SocketRole {
        self.role
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SocketState::Closed | SocketState::Reset)
    }

    pub fn rcv_conn_id(&self) -> u16 {
        self.rcv_conn_id
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn poll_event(&mut self) -> Option<SocketEvent> {
        self.events.pop_front()
    }

    fn advertised_window(&self) -> u32 {
        let buffered: usize = self.recv_buffer.values().map(Vec::len).sum();
        RECV_WINDOW.saturating_sub(buffered as u32)
    }

    fn make_state(&self, now_micros: u32, peer_micros: u32) -> Packet {
        Packet {
            ptype: PacketType::State,
            connection_id: self.snd_conn_id,
            timestamp_micros: now_micros,
            timestamp_diff_micros: now_micros.wrapping_sub(peer_micros),
            wnd_size: self.advertised_window(),
            seq_nr: self.seq_nr,
            ack_nr: self.ack_nr,
            selective_ack: self.selective_ack(),
            payload: Vec::new(),
        }
    }

    /// The bitmap over the 32 sequence numbers past `ack_nr + 1`, or `None`
    /// when nothing is buffered out of order.
    fn selective_ack(&self) -> Option<SelectiveAck> {
        if self.recv_buffer.is_empty() {
            return None;
        }
        let mut sack = SelectiveAck::default();
        for seq in self.recv_buffer.keys() {
            let bit = seq.wrapping_sub(self.ack_nr.wrapping_add(2));
            sack.set(bit as u32);
        }
        if sack.is_empty() { None } else { Some(sack) }
    }

    fn make_reset(&self, now_micros: u32) -> Packet {
        Packet {
            ptype: PacketType::Reset,
            connection_id: self.snd_conn_id,
            timestamp_micros: now_micros,
            timestamp_diff_micros: 0,
            wnd_size: 0,
            seq_nr: self.seq_nr,
            ack_nr: self.ack_nr,
            selective_ack: None,
            payload: Vec::new(),
        }
    }

    fn enter_reset(&mut self, reason: ResetReason) {
        if self.is_terminal() {
            return;
        }
        warn!(?reason, conn = self.rcv_conn_id, "utp socket reset");
        self.state = SocketState::Reset;
        self.chunks.clear();
        self.out_buffer.clear();
        self.in_flight_order.clear();
        self.recv_buffer.clear();
        self.events.push_back(SocketEvent::Reset(reason));
    }

    /// Feeds one decoded packet to the state machine. Returns the packets to
    /// send in response.
    pub fn handle_packet(&mut self, pkt: &Packet, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.last_activity = now;
        self.peer_window = pkt.wnd_size;

        match pkt.ptype {
            PacketType::Reset => {
                self.enter_reset(ResetReason::PeerReset);
                Vec::new()
            }
            PacketType::Syn => {
                // A duplicate SYN for an established flow (the SYN-ACK was
                // lost): repeat the handshake ack, with the original
                // sequence seed, instead of tearing anything down.
                if self.peer_seq_seeded && seq_le(pkt.seq_nr, self.ack_nr) {
                    let mut syn_ack = self.make_state(now_micros, pkt.timestamp_micros);
                    syn_ack.seq_nr = self.initial_send_seq;
                    vec![syn_ack]
                } else {
                    vec![self.make_reset(now_micros)]
                }
            }
            PacketType::State => self.handle_state(pkt, now, now_micros),
            PacketType::Data => self.handle_data(pkt, now, now_micros),
            PacketType::Fin => self.handle_fin(pkt, now, now_micros),
        }
    }

    fn handle_state(&mut self, pkt: &Packet, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.state == SocketState::SynSent {
            // The SYN-ACK must ack our SYN and seeds the peer's numbering.
            if pkt.ack_nr != 1 {
                return vec![self.make_reset(now_micros)];
            }
            self.syn_packet = None;
            self.ack_nr = pkt.seq_nr;
            self.peer_seq_seeded = true;
            self.state = SocketState::Connected;
            self.events.push_back(SocketEvent::Connected);
            debug!(conn = self.rcv_conn_id, role = ?self.role, "utp connected");
            return match self.role {
                // The reader waits for DATA; nothing to send yet.
                SocketRole::Read => Vec::new(),
                SocketRole::Write => self.fill_window(now, now_micros),
            };
        }

        let mut acked_bytes = 0usize;
        let mut rtt_sample: Option<Duration> = None;
        let mut newly_acked = false;

        // Cumulative portion.
        let acked: Vec<u16> = self
            .out_buffer
            .keys()
            .copied()
            .filter(|seq| seq_le(*seq, pkt.ack_nr))
            .collect();
        for seq in acked {
            if let Some(out) = self.out_buffer.remove(&seq) {
                acked_bytes += out.payload.len();
                newly_acked = true;
                if out.transmissions == 1 {
                    rtt_sample = Some(now.saturating_duration_since(out.last_sent_at));
                }
            }
        }

        // Selective portion: frees window space but leaves the hole in front.
        if let Some(sack) = pkt.selective_ack {
            for seq in sack.acked_seqs(pkt.ack_nr) {
                if let Some(out) = self.out_buffer.remove(&seq) {
                    acked_bytes += out.payload.len();
                    newly_acked = true;
                }
            }
        }
        self.in_flight_order
            .retain(|seq| self.out_buffer.contains_key(seq));

        let outcome = self.congestion.on_ack(
            acked_bytes,
            pkt.timestamp_diff_micros,
            rtt_sample,
            now,
        );

        // Three packets acked beyond an outstanding hole: treat as loss and
        // retransmit the hole immediately.
        let mut replies = Vec::new();
        if let Some(sack) = pkt.selective_ack
            && sack.0.count_ones() >= 3
            && let Some(&hole) = self.in_flight_order.front()
        {
            replies.extend(self.retransmit(hole, now, now_micros));
        }

        if self.fin_seq.is_some_and(|fin| seq_le(fin, pkt.ack_nr)) {
            self.state = SocketState::Closed;
            self.events.push_back(SocketEvent::Closed);
            return replies;
        }

        if newly_acked || outcome.write_ready {
            replies.extend(self.fill_window(now, now_micros));
        }
        replies
    }

    fn handle_data(&mut self, pkt: &Packet, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.role != SocketRole::Read {
            return vec![self.make_reset(now_micros)];
        }
        if self.state == SocketState::SynSent || !self.peer_seq_seeded {
            // DATA cannot be sequenced before the SYN-ACK seeds ack_nr;
            // the SYN retry path recovers a lost handshake.
            return Vec::new();
        }

        let next = self.ack_nr.wrapping_add(1);
        if pkt.seq_nr == next {
            self.content.extend_from_slice(&pkt.payload);
            self.ack_nr = next;
            self.drain_recv_buffer();
        } else if seq_le(pkt.seq_nr, self.ack_nr) {
            // Duplicate of something already delivered; re-ack.
        } else {
            if self.recv_buffer.len() >= MAX_RECV_BUFFER_PACKETS {
                self.enter_reset(ResetReason::BufferOverflow);
                return vec![self.make_reset(now_micros)];
            }
            self.recv_buffer
                .entry(pkt.seq_nr)
                .or_insert_with(|| pkt.payload.clone());
        }

        if self.framed {
            self.emit_frames();
            if self.state == SocketState::Reset {
                return vec![self.make_reset(now_micros)];
            }
        }

        let mut replies = vec![self.make_state(now_micros, pkt.timestamp_micros)];
        if self.state == SocketState::GotFin {
            replies.extend(self.try_close_after_fin(now_micros, pkt.timestamp_micros));
        }
        replies
    }

    fn handle_fin(&mut self, pkt: &Packet, _now: Instant, now_micros: u32) -> Vec<Packet> {
        match self.role {
            SocketRole::Read => {
                if !self.peer_seq_seeded {
                    return Vec::new();
                }
                self.fin_nr = Some(pkt.seq_nr);
                if self.state == SocketState::Connected || self.state == SocketState::SynRecv {
                    self.state = SocketState::GotFin;
                }
                let replies = self.try_close_after_fin(now_micros, pkt.timestamp_micros);
                if replies.is_empty() {
                    // Holes below the FIN: ack what we have so the writer
                    // retransmits the missing pieces.
                    vec![self.make_state(now_micros, pkt.timestamp_micros)]
                } else {
                    replies
                }
            }
            SocketRole::Write => {
                // The peer tore the transfer down from its side.
                let done = self.chunks.is_empty() && self.out_buffer.is_empty();
                if done {
                    self.ack_nr = pkt.seq_nr;
                    self.state = SocketState::Closed;
                    self.events.push_back(SocketEvent::Closed);
                    vec![self.make_state(now_micros, pkt.timestamp_micros)]
                } else {
                    self.enter_reset(ResetReason::ProtocolViolation);
                    vec![self.make_reset(now_micros)]
                }
            }
        }
    }

    fn try_close_after_fin(&mut self, now_micros: u32, peer_micros: u32) -> Vec<Packet> {
        let Some(fin) = self.fin_nr else {
            return Vec::new();
        };
        if self.ack_nr.wrapping_add(1) != fin {
            // Still missing DATA below the FIN.
            return Vec::new();
        }
        self.ack_nr = fin;
        self.state = SocketState::Closed;
        if self.framed {
            self.emit_frames();
        } else {
            let content = std::mem::take(&mut self.content);
            self.events.push_back(SocketEvent::Delivered(content));
        }
        self.events.push_back(SocketEvent::Closed);
        vec![self.make_state(now_micros, peer_micros)]
    }

    fn drain_recv_buffer(&mut self) {
        loop {
            let next = self.ack_nr.wrapping_add(1);
            match self.recv_buffer.remove(&next) {
                Some(payload) => {
                    self.content.extend_from_slice(&payload);
                    self.ack_nr = next;
                }
                None => return,
            }
        }
    }

    fn emit_frames(&mut self) {
        match self.frames.drain(&self.content) {
            Ok(frames) => {
                for frame in frames {
                    self.events.push_back(SocketEvent::Frame(frame));
                }
            }
            Err(_) => self.enter_reset(ResetReason::ProtocolViolation),
        }
    }

    /// Emits as many DATA packets as the congestion and peer windows allow,
    /// then the FIN once everything else is out and acked.
    fn fill_window(&mut self, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.role != SocketRole::Write || self.state != SocketState::Connected {
            return Vec::new();
        }
        let mut out = Vec::new();
        while let Some(chunk) = self.chunks.front() {
            let len = chunk.len();
            if !self.congestion.can_send(len) {
                break;
            }
            if self.congestion.cur_window() + len > self.peer_window as usize {
                break;
            }
            let chunk = self.chunks.pop_front().unwrap_or_default();
            let seq = self.seq_nr;
            self.seq_nr = self.seq_nr.wrapping_add(1);
            let pkt = Packet {
                ptype: PacketType::Data,
                connection_id: self.snd_conn_id,
                timestamp_micros: now_micros,
                timestamp_diff_micros: 0,
                wnd_size: self.advertised_window(),
                seq_nr: seq,
                ack_nr: self.ack_nr,
                selective_ack: None,
                payload: chunk,
            };
            self.congestion.on_packet_sent(len);
            self.out_buffer.insert(
                seq,
                OutPacket {
                    payload: pkt.payload.clone(),
                    is_fin: false,
                    transmissions: 1,
                    last_sent_at: now,
                },
            );
            self.in_flight_order.push_back(seq);
            out.push(pkt);
        }

        if self.chunks.is_empty() && self.out_buffer.is_empty() && self.fin_seq.is_none() {
            let seq = self.seq_nr;
            self.seq_nr = self.seq_nr.wrapping_add(1);
            self.fin_seq = Some(seq);
            let fin = Packet {
                ptype: PacketType::Fin,
                connection_id: self.snd_conn_id,
                timestamp_micros: now_micros,
                timestamp_diff_micros: 0,
                wnd_size: self.advertised_window(),
                seq_nr: seq,
                ack_nr: self.ack_nr,
                selective_ack: None,
                payload: Vec::new(),
            };
            self.out_buffer.insert(
                seq,
                OutPacket {
                    payload: Vec::new(),
                    is_fin: true,
                    transmissions: 1,
                    last_sent_at: now,
                },
            );
            self.in_flight_order.push_back(seq);
            out.push(fin);
        }
        out
    }

    fn retransmit(&mut self, seq: u16, now: Instant, now_micros: u32) -> Vec<Packet> {
        let ack_nr = self.ack_nr;
        let snd_conn_id = self.snd_conn_id;
        let wnd = self.advertised_window();
        let Some(out) = self.out_buffer.get_mut(&seq) else {
            return Vec::new();
        };
        out.transmissions += 1;
        out.last_sent_at = now;
        let pkt = Packet {
            ptype: if out.is_fin {
                PacketType::Fin
            } else {
                PacketType::Data
            },
            connection_id: snd_conn_id,
            timestamp_micros: now_micros,
            timestamp_diff_micros: 0,
            wnd_size: wnd,
            seq_nr: seq,
            ack_nr,
            selective_ack: None,
            payload: out.payload.clone(),
        };
        // Re-book the bytes so a retransmission never inflates the in-flight
        // accounting past one copy.
        self.congestion.on_bytes_freed(pkt.payload.len());
        self.congestion.on_packet_sent(pkt.payload.len());
        vec![pkt]
    }

    /// Timer entry point: retransmission timeouts and SYN retries.
    pub fn on_tick(&mut self, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.is_terminal() {
            return Vec::new();
        }

        if self.state == SocketState::SynSent {
            if now.saturating_duration_since(self.last_activity) >= self.congestion.rto() {
                if self.congestion.on_timeout() {
                    self.enter_reset(ResetReason::Timeout);
                    return vec![self.make_reset(now_micros)];
                }
                self.last_activity = now;
                if let Some(mut syn) = self.syn_packet.clone() {
                    syn.timestamp_micros = now_micros;
                    return vec![syn];
                }
            }
            return Vec::new();
        }

        let Some(&oldest) = self.in_flight_order.front() else {
            // Nothing in flight but data queued: the peer window pinched us
            // shut earlier. Probe so the transfer cannot deadlock.
            if !self.chunks.is_empty()
                && now.saturating_duration_since(self.last_activity) >= self.congestion.rto()
            {
                self.last_activity = now;
                self.peer_window = self.peer_window.max(PAYLOAD_SIZE as u32);
                return self.fill_window(now, now_micros);
            }
            return Vec::new();
        };
        let sent_at = match self.out_buffer.get(&oldest) {
            Some(out) => out.last_sent_at,
            None => return Vec::new(),
        };
        if now.saturating_duration_since(sent_at) < self.congestion.rto() {
            return Vec::new();
        }

        if self.congestion.on_timeout() {
            self.enter_reset(ResetReason::Timeout);
            return vec![self.make_reset(now_micros)];
        }
        debug!(conn = self.rcv_conn_id, seq = oldest, "rto expired, retransmitting");
        self.retransmit(oldest, now, now_micros)
    }

    /// The next instant at which `on_tick` could have work to do.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        if self.is_terminal() {
            return None;
        }
        if self.state == SocketState::SynSent {
            return Some(self.last_activity + self.congestion.rto());
        }
        match self.in_flight_order.front() {
            Some(oldest) => {
                let out = self.out_buffer.get(oldest)?;
                Some((out.last_sent_at + self.congestion.rto()).max(now))
            }
            None if !self.chunks.is_empty() => {
                Some(self.last_activity + self.congestion.rto())
            }
            None => None,
        }
    }

    /// Content accumulated so far (READ side); complete only after `Closed`.
    pub fn content_len(&self) -> usize {
        self.content.len()
    }

    pub fn congestion(&self) -> &Ledbat {
        &self.congestion
    }

    /// Validates that an incoming packet belongs to this flow.
    pub fn accepts_conn_id(&self, conn_id: u16) -> bool {
        conn_id == self.rcv_conn_id || conn_id == self.snd_conn_id
    }

    /// Number of DATA packets a transfer of `len` bytes produces.
    pub fn expected_packets(len: usize) -> usize {
        len.div_ceil(PAYLOAD_SIZE)
    }

    /// Internal invariant check used by tests.
    #[doc(hidden)]
    pub fn debug_validate(&self) -> UtpResult<()> {
        if self.recv_buffer.len() > MAX_RECV_BUFFER_PACKETS {
            return Err(UtpError::BufferOverflow);
        }
        for seq in self.recv_buffer.keys() {
            if seq_le(*seq, self.ack_nr) {
                return Err(UtpError::UnexpectedState);
            }
        }
        Ok(())
    }
}
