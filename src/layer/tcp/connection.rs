use alloc::collections::BTreeMap;

use crate::managed::Key;
use crate::packet::Packet;
use crate::storage::{ByteStreamMaintainer, ModificationList};
use crate::time::Instant;
use crate::wire::{Ipv4Address, SeqNumber};

use super::timing::RetransmissionTiming;

/// How long a fully closed connection record lingers to absorb stragglers
/// before the flow-table entry is removed and the record reused (2·MSL).
pub(super) const RELEASE_GRACE: crate::time::Duration = crate::time::Duration::from_secs(60);

/// One of the two halves of a connection.
///
/// A direction is configured, not inferred: the element graph steers one
/// flow of packets through the direction-0 tracker and the reverse flow
/// through direction 1. Used as an index into the per-direction arrays of
/// [`TcpCommon`].
///
/// [`TcpCommon`]: struct.TcpCommon.html
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Direction(u8);

impl Direction {
    /// Construct from the configured flow direction, `0` or `1`.
    pub fn new(raw: u8) -> Option<Direction> {
        match raw {
            0 | 1 => Some(Direction(raw)),
            _ => None,
        }
    }

    /// The other half of the connection.
    pub fn opposite(self) -> Direction {
        Direction(1 - self.0)
    }

    /// Index into a per-direction pair.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// The four-tuple identifying one direction of a connection on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FourTuple {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FourTuple {
    /// The tuple of a packet as seen on the wire.
    pub fn of_packet(packet: &Packet) -> FourTuple {
        FourTuple {
            src: packet.src_addr(),
            dst: packet.dst_addr(),
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
        }
    }

    /// The tuple of the reverse direction.
    pub fn reversed(self) -> FourTuple {
        FourTuple {
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

/// Lifecycle of one direction of a connection.
///
/// Transitions are monotonic: a direction never reopens, and an ungraceful
/// close supersedes a graceful one but not the reverse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClosingState {
    Open,
    BeingClosedGraceful,
    ClosedGraceful,
    BeingClosedUngraceful,
    ClosedUngraceful,
}

impl ClosingState {
    /// Whether this side no longer accepts traffic.
    pub fn is_closing(self) -> bool {
        self != ClosingState::Open
    }

    /// Whether the close, if any, is on the graceful track.
    pub fn is_graceful(self) -> bool {
        matches!(self, ClosingState::BeingClosedGraceful | ClosingState::ClosedGraceful)
    }

    /// Whether the direction reached a terminal state.
    pub fn is_closed(self) -> bool {
        matches!(self, ClosingState::ClosedGraceful | ClosingState::ClosedUngraceful)
    }

    /// Apply a requested transition, keeping the progression monotonic.
    ///
    /// The derived order encodes the allowed progression; a request to move
    /// backwards leaves the state unchanged.
    pub fn advance(&mut self, to: ClosingState) {
        if to > *self {
            *self = to;
        }
    }
}

impl Default for ClosingState {
    fn default() -> Self {
        ClosingState::Open
    }
}

/// The bidirectional state shared by the two directions of one connection.
///
/// Allocated from the endpoint pool by the initiator direction, found via the
/// reversed four-tuple by the responder, and released once both directions
/// closed and the post-close grace period expired.
#[derive(Debug, Default)]
pub struct TcpCommon {
    pub maintainers: [ByteStreamMaintainer; 2],
    pub timings: [RetransmissionTiming; 2],
    pub closing: [ClosingState; 2],

    /// The initiator tuple under which the record is published.
    pub(super) flow_id: FourTuple,

    /// Set once both directions are closed; the record is reclaimed after
    /// the grace period from this point.
    pub(super) release_after: Option<Instant>,
}

impl TcpCommon {
    /// Reset for reuse from the pool.
    pub(super) fn reset(&mut self) {
        self.maintainers[0].reset();
        self.maintainers[1].reset();
        self.timings[0].reset();
        self.timings[1].reset();
        self.closing = [ClosingState::Open; 2];
        self.flow_id = FourTuple::default();
        self.release_after = None;
    }

    /// Whether both directions reached a terminal closing state.
    pub fn fully_closed(&self) -> bool {
        self.closing[0].is_closed() && self.closing[1].is_closed()
    }
}

/// The flow control block: the per-connection side channel.
///
/// Exactly one exists per connection, populated by the classifier in front
/// of the trackers and handed in with every packet of either direction.
#[derive(Debug, Default)]
pub struct Fcb {
    /// Key of the connection's [`TcpCommon`] in the endpoint pool.
    ///
    /// [`TcpCommon`]: struct.TcpCommon.html
    pub(super) common: Option<Key>,
    pub(super) halves: [FcbHalf; 2],
}

/// Per-direction tracker state inside the FCB.
#[derive(Debug, Default)]
pub(super) struct FcbHalf {
    /// Whether this direction already resolved its connection record.
    pub(super) associated: bool,

    /// Whether this direction allocated the TcpCommon and must release it.
    pub(super) in_charge: bool,

    /// The tuple this direction published in the flow table, if any.
    pub(super) flow: Option<FourTuple>,

    /// Modification lists of this direction's packets, by original sequence
    /// number. Retransmissions find and replay their original list here.
    pub(super) edits: BTreeMap<SeqNumber, ModificationList>,
}

impl Fcb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key of the associated connection record.
    pub fn common(&self) -> Option<Key> {
        self.common
    }

    /// Whether the given direction completed association.
    pub fn is_associated(&self, direction: Direction) -> bool {
        self.halves[direction.index()].associated
    }

    /// The modification list recorded for an original packet, if any.
    pub fn edits(&self, direction: Direction, seq: SeqNumber) -> Option<&ModificationList> {
        self.halves[direction.index()].edits.get(&seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_roundtrip() {
        let zero = Direction::new(0).unwrap();
        let one = Direction::new(1).unwrap();
        assert_eq!(Direction::new(2), None);
        assert_eq!(zero.opposite(), one);
        assert_eq!(one.opposite(), zero);
        assert_eq!(zero.index(), 0);
        assert_eq!(one.index(), 1);
    }

    #[test]
    fn tuple_reversal() {
        let tuple = FourTuple {
            src: Ipv4Address::new(10, 0, 0, 1),
            dst: Ipv4Address::new(10, 0, 0, 2),
            src_port: 40000,
            dst_port: 80,
        };
        let reversed = tuple.reversed();
        assert_eq!(reversed.src, tuple.dst);
        assert_eq!(reversed.dst_port, tuple.src_port);
        assert_eq!(reversed.reversed(), tuple);
    }

    #[test]
    fn closing_is_monotonic() {
        let mut state = ClosingState::Open;
        state.advance(ClosingState::BeingClosedGraceful);
        assert_eq!(state, ClosingState::BeingClosedGraceful);

        // Never back to open.
        state.advance(ClosingState::Open);
        assert_eq!(state, ClosingState::BeingClosedGraceful);

        state.advance(ClosingState::ClosedGraceful);
        assert_eq!(state, ClosingState::ClosedGraceful);

        // Ungraceful supersedes graceful.
        state.advance(ClosingState::ClosedUngraceful);
        assert_eq!(state, ClosingState::ClosedUngraceful);

        // But not the reverse.
        state.advance(ClosingState::ClosedGraceful);
        assert_eq!(state, ClosingState::ClosedUngraceful);
    }
}
