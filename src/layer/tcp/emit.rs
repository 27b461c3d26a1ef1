use alloc::collections::VecDeque;

use crate::packet::Packet;
use crate::storage::ByteStreamMaintainer;
use crate::time::Instant;
use crate::wire::{Ipv4Address, SeqNumber, TcpFlags};

use super::connection::{ClosingState, Direction, Fcb, TcpCommon, RELEASE_GRACE};
use super::endpoint::Endpoint;

/// The exit element of one direction: finalizes every packet leaving the
/// middlebox on that direction and forges the reverse-path control packets
/// (acknowledgements, closing packets) its tracker asks for.
///
/// Forged packets travel against the direction's flow; they are queued here
/// and drained by the driver onto the reverse path.
pub struct TcpOut {
    direction: Direction,
    pending: VecDeque<Packet>,
}

impl TcpOut {
    pub fn new(direction: Direction) -> Self {
        TcpOut {
            direction,
            pending: VecDeque::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Finalize a packet for the wire.
    ///
    /// Folds the packet's modification list into the direction's stream
    /// maintainer (exactly once; retransmissions find it committed), maps
    /// the sequence number into the edited numberspace, updates the
    /// direction's send bookkeeping, and recomputes checksums when the
    /// packet was modified anywhere along the stack.
    pub fn emit(
        &mut self,
        endpoint: &mut Endpoint,
        fcb: &mut Fcb,
        mut packet: Packet,
        now: Instant,
    ) -> Option<Packet> {
        let dir = self.direction.index();

        let key = match fcb.common() {
            Some(key) => key,
            // Not a tracked flow; pass through untouched.
            None => return Some(packet),
        };

        let seq = packet.seq_number();

        // Push this packet's edits into the maintainer, once. A deletion is
        // keyed at the end of its removed range so that earlier original
        // numbers keep their mapping; an insertion is keyed at its position.
        let mut own_head_insert = 0i64;
        if let Some(list) = fcb.halves[dir].edits.get_mut(&seq) {
            if !list.is_committed() {
                let common = endpoint.get_mut(key)?;
                for edit in list.iter() {
                    let (at, delta) = if edit.length < 0 {
                        (edit.position + (-edit.length) as usize, edit.length)
                    } else {
                        (edit.position, edit.length)
                    };
                    common.maintainers[dir].insert_modification(at, i64::from(delta));
                }
                list.commit();
            }
            // Bytes inserted at the head of this packet travel inside it:
            // the wire packet starts at the insertion, not behind it. This
            // also keeps the rewrite stable across retransmissions of the
            // same original packet.
            own_head_insert = list.iter()
                .filter(|edit| edit.length > 0 && edit.position == seq)
                .map(|edit| i64::from(edit.length))
                .sum();
        }

        let common = endpoint.get_mut(key)?;

        let mapped = common.maintainers[dir].map_seq(seq).offset(-own_head_insert);
        if mapped != seq {
            net_trace!("seq {} becomes {} on flow {}", seq, mapped, dir);
            packet.tcp_mut().set_seq_number(mapped);
            packet.set_dirty(true);
        }

        if packet.flags().ack() {
            common.maintainers[dir].set_last_ack_sent(packet.ack_number());
        }

        let end = mapped + packet.tcp().sequence_len();
        let is_retransmit = common.maintainers[dir]
            .last_seq_sent()
            .map_or(false, |last| end <= last);
        if !is_retransmit {
            common.maintainers[dir].set_last_seq_sent(end);
        }
        if end - mapped > 0 {
            common.timings[dir].signal_send(end, now, is_retransmit);
        }

        // A closing packet leaving completes this direction's close; once
        // both directions are terminal the record enters its grace period.
        let flags = packet.flags();
        if flags.fin() || flags.rst() {
            let state = common.closing[dir];
            if state == ClosingState::BeingClosedGraceful
                || state == ClosingState::BeingClosedUngraceful
            {
                let terminal = if flags.rst() {
                    ClosingState::ClosedUngraceful
                } else {
                    ClosingState::ClosedGraceful
                };
                common.closing[dir].advance(terminal);
                if common.fully_closed() && common.release_after.is_none() {
                    common.timings[0].disarm();
                    common.timings[1].disarm();
                    common.release_after = Some(now + RELEASE_GRACE);
                }
            }
        }

        if packet.is_dirty() {
            packet.fill_checksums();
        }
        Some(packet)
    }

    /// Forge a bare acknowledgement onto the reverse path.
    ///
    /// `maintainer` is the reverse direction's maintainer; its last-ack-sent
    /// scalar records what we acknowledged so the tracker can detect lost
    /// acknowledgements and redundant ones.
    pub fn send_ack(
        &mut self,
        maintainer: &mut ByteStreamMaintainer,
        saddr: Ipv4Address,
        daddr: Ipv4Address,
        sport: u16,
        dport: u16,
        seq: SeqNumber,
        ack: SeqNumber,
        window: u16,
    ) {
        maintainer.set_last_ack_sent(ack);

        let flags = TcpFlags::default();
        let packet = Packet::forge(saddr, daddr, sport, dport, seq, Some(ack), window, flags, &[]);
        net_trace!("forged ack {} on flow {}", ack, self.direction.index());
        self.pending.push_back(packet);
    }

    /// Forge the closing packet of a both-sides close onto the reverse path.
    ///
    /// Graceful closes send FIN, ungraceful ones RST; either carries the
    /// acknowledgement for the packet that triggered the close.
    pub fn send_closing_packet(
        &mut self,
        maintainer: &mut ByteStreamMaintainer,
        saddr: Ipv4Address,
        daddr: Ipv4Address,
        sport: u16,
        dport: u16,
        seq: SeqNumber,
        ack: SeqNumber,
        window: u16,
        graceful: bool,
    ) {
        maintainer.set_last_ack_sent(ack);

        let mut flags = TcpFlags::default();
        if graceful {
            flags.set_fin(true);
        } else {
            flags.set_rst(true);
        }
        let packet = Packet::forge(saddr, daddr, sport, dport, seq, Some(ack), window, flags, &[]);
        net_debug!("forged closing packet on flow {} (graceful: {})", self.direction.index(), graceful);
        self.pending.push_back(packet);
    }

    /// Re-send the current acknowledgement of `direction`'s stream.
    ///
    /// Called when that direction's retransmission timer fired: a duplicate
    /// acknowledgement provokes the real sender into retransmitting, since
    /// the middlebox holds no data to retransmit itself.
    pub fn resend_ack(&mut self, common: &mut TcpCommon, direction: Direction) {
        let opp = direction.opposite().index();
        let maintainer = &mut common.maintainers[opp];

        let (ack, seq) = match (maintainer.last_ack_sent(), maintainer.last_seq_sent()) {
            (Some(ack), Some(seq)) => (ack, seq),
            // Nothing was ever sent on the reverse path; nothing to repeat.
            _ => return,
        };

        let saddr = maintainer.ip_src();
        let daddr = maintainer.ip_dst();
        let sport = maintainer.port_src();
        let dport = maintainer.port_dst();
        self.send_ack(maintainer, saddr, daddr, sport, dport, seq, ack, 0);
    }

    /// Shed an untrackable connection attempt with a reset.
    ///
    /// Load-shedding answer when the record pool is exhausted: the sender
    /// of `packet` receives a RST mirroring its segment.
    pub fn shed_with_rst(&mut self, packet: &Packet) {
        let mut flags = TcpFlags::default();
        flags.set_rst(true);

        let forged = Packet::forge(
            packet.dst_addr(),
            packet.src_addr(),
            packet.dst_port(),
            packet.src_port(),
            packet.ack_number(),
            Some(packet.next_seq_number()),
            0,
            flags,
            &[],
        );
        net_debug!("forged RST on flow {}", self.direction.index());
        self.pending.push_back(forged);
    }

    /// Number of queued reverse-path packets.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Take the next queued reverse-path packet.
    pub fn pop_pending(&mut self) -> Option<Packet> {
        self.pending.pop_front()
    }
}
