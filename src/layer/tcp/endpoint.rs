use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bytes::Bytes;

use crate::layer::{Error, StackElement};
use crate::managed::{Key, Pool};
use crate::packet::Packet;
use crate::time::Instant;

use super::connection::{ClosingState, Direction, Fcb, FourTuple, TcpCommon, RELEASE_GRACE};
use super::emit::TcpOut;
use super::timing::AckSignal;

/// Handles the connection state of every flow steered to one worker.
///
/// Owns the flow-id table and the fixed pool of [`TcpCommon`] records. The
/// two directions of a connection resolve each other through this registry:
/// the initiator publishes under its four-tuple, the responder finds the
/// record via the reversed tuple. Connection affinity guarantees both
/// directions run on the worker owning this endpoint, so none of this state
/// is shared across threads.
///
/// [`TcpCommon`]: struct.TcpCommon.html
pub struct Endpoint {
    table: BTreeMap<FourTuple, Key>,
    pool: Pool<TcpCommon>,
}

/// A retransmission timer fired for one direction of a connection.
///
/// The driver reacts by re-sending the direction's acknowledgement, see
/// [`TcpOut::resend_ack`].
///
/// [`TcpOut::resend_ack`]: struct.TcpOut.html#method.resend_ack
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerEvent {
    pub key: Key,
    pub direction: Direction,
}

impl Endpoint {
    /// Create an endpoint with room for `capacity` concurrent connections.
    pub fn new(capacity: usize) -> Self {
        Endpoint {
            table: BTreeMap::new(),
            pool: Pool::new(capacity),
        }
    }

    /// Retrieve a connection record.
    pub fn get(&self, key: Key) -> Option<&TcpCommon> {
        self.pool.get(key)
    }

    /// Retrieve a mutable connection record.
    pub fn get_mut(&mut self, key: Key) -> Option<&mut TcpCommon> {
        self.pool.get_mut(key)
    }

    /// Look up the record published under `tuple`.
    pub fn find_tuple(&self, tuple: FourTuple) -> Option<Key> {
        self.table.get(&tuple).copied()
    }

    /// Allocate and publish a record for a new connection.
    fn create(&mut self, tuple: FourTuple) -> Result<Key, Error> {
        if self.table.contains_key(&tuple) {
            return Err(Error::Illegal);
        }
        let (key, record) = self.pool.reserve().ok_or(Error::Exhausted)?;
        record.reset();
        record.flow_id = tuple;
        self.table.insert(tuple, key);
        Ok(key)
    }

    /// Tear a connection record down and return it to the pool.
    pub fn release(&mut self, key: Key) {
        let flow_id = match self.pool.get_mut(key) {
            Some(common) => {
                common.timings[0].disarm();
                common.timings[1].disarm();
                common.flow_id
            }
            None => return,
        };
        self.table.remove(&flow_id);
        self.pool.release(key);
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Drive timers and lifetimes forward.
    ///
    /// Releases records whose post-close grace period expired and returns
    /// one event per retransmission timer that fired.
    pub fn poll(&mut self, now: Instant) -> Vec<TimerEvent> {
        let keys: Vec<Key> = self.pool.keys().collect();
        let mut events = Vec::new();

        for key in keys {
            let expired = self.pool.get_mut(key)
                .and_then(|common| common.release_after)
                .map_or(false, |at| at <= now);
            if expired {
                self.release(key);
                continue;
            }

            let common = match self.pool.get_mut(key) {
                Some(common) => common,
                None => continue,
            };
            for raw in 0..2u8 {
                let direction = Direction::new(raw).expect("0 and 1 are directions");
                if common.timings[direction.index()].on_timer(now) {
                    events.push(TimerEvent { key, direction });
                }
            }
        }
        events
    }
}

/// Drop statistics of one tracker.
///
/// Every packet the tracker swallows is accounted to exactly one counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    /// Buffers too short or too twisted to parse as TCP in IPv4.
    pub malformed: u64,

    /// SYN-less packet on an unassociated flow, or no record for a SYN+ACK.
    pub unmatched: u64,

    /// SYN observed on an established connection.
    pub unexpected_syn: u64,

    /// Data arriving on a closing or closed direction.
    pub out_of_state: u64,

    /// Segments below the opposite direction's last sent acknowledgement.
    pub lost_ack: u64,

    /// Pure acknowledgements that carried no new information.
    pub redundant_ack: u64,

    /// Connections shed because the record pool was exhausted.
    pub exhausted: u64,
}

/// The entry element of one direction: validates, associates, and remaps
/// every incoming packet of that direction.
///
/// Configured with its flow direction; its outbound emitter and the
/// return-direction tracker are wired by the element graph, which passes the
/// shared [`Endpoint`] and the direction's [`TcpOut`] into each call.
///
/// [`Endpoint`]: struct.Endpoint.html
/// [`TcpOut`]: struct.TcpOut.html
pub struct TcpIn {
    direction: Direction,
    counters: Counters,
}

impl TcpIn {
    pub fn new(direction: Direction) -> Self {
        TcpIn {
            direction,
            counters: Counters::default(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Parse a raw buffer and process it.
    ///
    /// Convenience entry for drivers that receive plain octet buffers;
    /// malformed packets are dropped and counted here, before they reach the
    /// state machine.
    pub fn process_raw(
        &mut self,
        endpoint: &mut Endpoint,
        out: &mut TcpOut,
        fcb: &mut Fcb,
        data: impl Into<Bytes>,
        now: Instant,
    ) -> Option<Packet> {
        match Packet::parse(data) {
            Ok(packet) => self.process(endpoint, out, fcb, packet, now),
            Err(error) => {
                net_debug!("malformed packet on flow {}: {}", self.direction.index(), error);
                self.counters.malformed += 1;
                None
            }
        }
    }

    /// Process one packet of this direction.
    ///
    /// Returns the packet to forward downstream, or `None` when it was
    /// consumed (dropped, answered, or both). This call never fails; every
    /// non-forwarded packet is logged and counted.
    pub fn process(
        &mut self,
        endpoint: &mut Endpoint,
        out: &mut TcpOut,
        fcb: &mut Fcb,
        mut packet: Packet,
        now: Instant,
    ) -> Option<Packet> {
        let direction = self.direction;
        let dir = direction.index();
        let opp = direction.opposite().index();

        // Associate the connection record, or reject what cannot start one.
        if !fcb.halves[dir].associated {
            if !self.assign_common(endpoint, out, fcb, &packet) {
                return None;
            }
        } else if packet.flags().syn() {
            net_debug!("unexpected SYN on flow {}, dropping", dir);
            self.counters.unexpected_syn += 1;
            return None;
        }

        let key = fcb.common.expect("associated direction has a record");
        let common = match endpoint.get_mut(key) {
            Some(common) => common,
            None => {
                net_debug!("record of flow {} vanished, dropping", dir);
                self.counters.unmatched += 1;
                return None;
            }
        };

        // A closing direction accepts nothing more; on the graceful track
        // anything carrying information is re-acknowledged so the sender
        // stops retrying.
        let closing = common.closing[dir];
        if closing.is_closing() {
            if closing.is_graceful()
                && (packet.flags().fin() || packet.flags().syn() || packet.payload_len() > 0)
            {
                Self::ack_packet(direction, common, out, &packet, false);
            }
            net_debug!("packet on closing flow {}, dropping", dir);
            self.counters.out_of_state += 1;
            return None;
        }

        // From here on the packet may be rewritten.
        packet.uniquify();
        let content = packet.payload_offset();
        packet.set_content_offset(content);

        let seq = packet.seq_number();

        // The peer keeps sending data we already acknowledged: our ACK was
        // lost on its way. Acknowledge again, discard the duplicate data.
        if !packet.flags().syn() {
            if let Some(last_sent) = common.maintainers[opp].last_ack_sent() {
                if seq < last_sent {
                    net_debug!("lost ACK on flow {}: seq {} below {}", dir, seq, last_sent);
                    self.counters.lost_ack += 1;
                    Self::ack_packet(direction, common, out, &packet, false);
                    return None;
                }
            }
        }

        if packet.flags().ack() {
            let ack = packet.ack_number();
            let new_ack = common.maintainers[opp].map_ack(ack);

            common.maintainers[dir].set_last_ack_received(ack);
            common.maintainers[opp].prune(ack);
            if common.timings[opp].signal_ack(ack, now) == AckSignal::FastRetransmit {
                net_debug!("three duplicate ACKs on flow {}", dir);
            }

            if packet.flags().is_just_ack() && packet.payload_len() == 0 {
                if let Some(sent) = common.maintainers[dir].last_ack_sent() {
                    if new_ack <= sent {
                        net_debug!("redundant ACK {} on flow {}, dropping", new_ack, dir);
                        self.counters.redundant_ack += 1;
                        return None;
                    }
                }
            }

            if new_ack != ack {
                net_trace!("ack {} becomes {} on flow {}", ack, new_ack, dir);
                packet.tcp_mut().set_ack_number(new_ack);
                packet.set_dirty(true);
            }
        }

        Some(packet)
    }

    /// Borrow a per-flow handle implementing the stack hooks.
    ///
    /// This is what protocol logic above the tracker uses to edit bytes,
    /// request more packets, or close the connection.
    pub fn operator<'a>(
        &self,
        endpoint: &'a mut Endpoint,
        out: &'a mut TcpOut,
        fcb: &'a mut Fcb,
        now: Instant,
    ) -> Operator<'a> {
        Operator {
            direction: self.direction,
            now,
            endpoint,
            out,
            fcb,
        }
    }

    /// Run the association step for a packet on an unassociated direction.
    ///
    /// Returns false when the packet cannot establish state and must be
    /// dropped.
    fn assign_common(
        &mut self,
        endpoint: &mut Endpoint,
        out: &mut TcpOut,
        fcb: &mut Fcb,
        packet: &Packet,
    ) -> bool {
        let flags = packet.flags();
        let dir = self.direction.index();

        if !flags.syn() {
            // The first two packets of a connection are SYNs; anything else
            // here means we never saw the handshake.
            net_debug!("non-SYN packet on unassociated flow {}, dropping", dir);
            self.counters.unmatched += 1;
            return false;
        }

        if flags.ack() {
            // SYN+ACK: we are the responder direction. The initiator
            // allocated the record and published it under its own tuple,
            // which is ours reversed.
            let flow_id = FourTuple::of_packet(packet).reversed();
            let key = match endpoint.find_tuple(flow_id) {
                Some(key) => key,
                None => {
                    net_debug!("no initiator record for SYN+ACK on flow {}, dropping", dir);
                    self.counters.unmatched += 1;
                    return false;
                }
            };
            debug_assert!(fcb.common.map_or(true, |existing| existing == key));
            fcb.common = Some(key);
            fcb.halves[dir].in_charge = false;
        } else {
            // Plain SYN: we are the initiator direction and allocate.
            let flow_id = FourTuple::of_packet(packet);
            let key = match endpoint.create(flow_id) {
                Ok(key) => key,
                Err(Error::Exhausted) => {
                    net_debug!("connection pool exhausted, shedding flow {}", dir);
                    self.counters.exhausted += 1;
                    out.shed_with_rst(packet);
                    return false;
                }
                Err(_) => {
                    net_debug!("flow id collision on flow {}, dropping", dir);
                    self.counters.unmatched += 1;
                    return false;
                }
            };
            fcb.common = Some(key);
            fcb.halves[dir].in_charge = true;
            fcb.halves[dir].flow = Some(flow_id);
        }

        fcb.halves[dir].associated = true;

        let key = fcb.common.expect("just associated");
        let common = endpoint.get_mut(key).expect("record was just resolved");
        let maintainer = &mut common.maintainers[dir];
        maintainer.set_ip_src(packet.src_addr());
        maintainer.set_ip_dst(packet.dst_addr());
        maintainer.set_port_src(packet.src_port());
        maintainer.set_port_dst(packet.dst_port());
        true
    }

    /// Acknowledge `packet` back to its sender.
    ///
    /// The forged acknowledgement swaps the endpoints of the packet; its
    /// sequence number is the packet's own ack, mapped back through the
    /// opposite maintainer when that ack was already remapped.
    fn ack_packet(
        direction: Direction,
        common: &mut TcpCommon,
        out: &mut TcpOut,
        packet: &Packet,
        ack_mapped: bool,
    ) {
        let opp = direction.opposite().index();

        let saddr = packet.dst_addr();
        let daddr = packet.src_addr();
        let sport = packet.dst_port();
        let dport = packet.src_port();

        let mut seq = packet.ack_number();
        if ack_mapped {
            seq = common.maintainers[opp].map_seq(seq);
        }

        let mut ack = packet.seq_number() + packet.payload_len();
        if packet.flags().fin() || packet.flags().syn() {
            ack = ack + 1;
        }

        out.send_ack(
            &mut common.maintainers[opp],
            saddr, daddr, sport, dport,
            seq, ack,
            packet.window_len(),
        );
    }
}

/// A borrowed handle on one flow, from the perspective of one direction.
///
/// Bundles everything the stack hooks need: the direction, the shared
/// endpoint, the direction's emitter, and the flow control block. Lives for
/// one processing step; the stacked protocol logic receives it as its
/// [`StackElement`] owner.
///
/// [`StackElement`]: ../trait.StackElement.html
pub struct Operator<'a> {
    direction: Direction,
    now: Instant,
    endpoint: &'a mut Endpoint,
    out: &'a mut TcpOut,
    fcb: &'a mut Fcb,
}

impl Operator<'_> {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Close the connection, triggered while holding `packet`.
    ///
    /// The held packet itself is flagged (FIN or RST) so the endpoint it
    /// travels to learns of the close; with `both_sides` the opposite
    /// endpoint additionally receives a forged closing packet and its
    /// direction goes terminal immediately.
    pub fn close(&mut self, packet: &mut Packet, graceful: bool, both_sides: bool) {
        let dir = self.direction.index();
        let opp = self.direction.opposite().index();

        let mut flags = packet.flags();
        if graceful {
            flags.set_fin(true);
        } else {
            flags.set_rst(true);
        }
        packet.tcp_mut().set_flags(flags);
        packet.set_dirty(true);

        let (state_self, state_other) = if graceful {
            (ClosingState::BeingClosedGraceful, ClosingState::ClosedGraceful)
        } else {
            (ClosingState::BeingClosedUngraceful, ClosingState::ClosedUngraceful)
        };

        let key = match self.fcb.common {
            Some(key) => key,
            None => return,
        };
        let common = match self.endpoint.get_mut(key) {
            Some(common) => common,
            None => return,
        };

        common.closing[dir].advance(state_self);

        if both_sides {
            common.closing[opp].advance(state_other);

            let saddr = packet.dst_addr();
            let daddr = packet.src_addr();
            let sport = packet.dst_port();
            let dport = packet.src_port();

            // The forged packet continues the opposite stream: its seq is
            // the (un-remapped) ack of the held packet.
            let seq = common.maintainers[opp].map_seq(packet.ack_number());
            let mut ack = packet.seq_number() + packet.payload_len();
            if packet.flags().fin() || packet.flags().syn() {
                ack = ack + 1;
            }

            self.out.send_closing_packet(
                &mut common.maintainers[opp],
                saddr, daddr, sport, dport,
                seq, ack,
                packet.window_len(),
                graceful,
            );
        }

        net_debug!("closing flow {} (graceful: {}, both: {})", dir, graceful, both_sides);

        if common.fully_closed() {
            common.timings[0].disarm();
            common.timings[1].disarm();
            common.release_after = Some(self.now + RELEASE_GRACE);
        }
    }
}

impl StackElement for Operator<'_> {
    fn close_connection(&mut self, packet: &mut Packet, graceful: bool, both_sides: bool) {
        self.close(packet, graceful, both_sides)
    }

    fn remove_bytes(&mut self, packet: &mut Packet, position: usize, length: usize) {
        let dir = self.direction.index();
        let seq = packet.seq_number();
        let at = seq + (packet.content_offset() + position - packet.payload_offset());

        let list = self.fcb.halves[dir].edits.entry(seq).or_default();
        // A committed list means this is a byte-identical retransmission:
        // replay the edit on the bytes, keep the records as they are.
        list.add_modification(at, -(length as i32));

        packet.remove_content(position, length);
        packet.set_dirty(true);
    }

    fn insert_bytes(&mut self, packet: &mut Packet, position: usize, length: usize) {
        let dir = self.direction.index();
        let seq = packet.seq_number();
        let at = seq + (packet.content_offset() + position - packet.payload_offset());

        let list = self.fcb.halves[dir].edits.entry(seq).or_default();
        list.add_modification(at, length as i32);

        packet.insert_content(position, length);
        packet.set_dirty(true);
    }

    fn request_more_packets(&mut self, packet: &Packet) {
        let key = match self.fcb.common {
            Some(key) => key,
            None => return,
        };
        if let Some(common) = self.endpoint.get_mut(key) {
            TcpIn::ack_packet(self.direction, common, self.out, packet, true);
        }
    }

    fn set_dirty(&mut self, packet: &mut Packet) {
        packet.set_dirty(true);
    }
}
