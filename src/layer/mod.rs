//! The process logic of the middlebox pipeline.
//!
//! ## Layering
//!
//! The packet representation lives in `wire` and `packet`; this module holds
//! the processing parts: the TCP connection tracker and emitter in
//! [`tcp`], and the [`StackElement`] capability set through which stacked
//! protocol layers observe and react to byte-level modifications.
//!
//! ## Stack forwarding
//!
//! Layers stacked above the connection tracker (an HTTP rewriter above a
//! TCP tracker, say) all need to see the same events: a removal of bytes, a
//! connection closing, a request for more packets. Instead of virtual call
//! chains through base classes this is an explicit ordered list of
//! trait-object handles — [`Chain`] — and a loop invoking the same operation
//! down the list.
//!
//! ## Errors
//!
//! Processing failures never escape to the packet path's caller: the
//! per-packet contract returns a packet or nothing. `Error` values exist for
//! the construction and forging paths.
//!
//! [`tcp`]: tcp/index.html
//! [`StackElement`]: trait.StackElement.html
//! [`Chain`]: struct.Chain.html

use crate::packet::Packet;

pub mod tcp;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// The operation was not permitted.
    ///
    /// Returned when the element does not allow or implement an operation in
    /// its current state.
    Illegal,

    /// Not enough space for the requested packet.
    BadSize,

    /// The action could not be completed because there were not enough
    /// resources.
    ///
    /// In contrast to `Illegal` this implies that it would have been legal
    /// with more resources; the caller sheds load instead of failing.
    Exhausted,
}

/// Can convert from a wire error.
///
/// This indicates some layer tried to operate on a packet but failed.
impl From<crate::wire::Error> for Error {
    fn from(_: crate::wire::Error) -> Self {
        Error::Illegal
    }
}

/// The capability set a stacked protocol element may implement.
///
/// Every operation has a default empty implementation; an element overrides
/// the ones it reacts to. The connection tracker's `Operator` implements the
/// byte-editing subset with real bookkeeping, elements above typically only
/// observe.
pub trait StackElement {
    /// Inspect, and possibly consume, a packet moving down the stack.
    fn process(&mut self, packet: Packet) -> Option<Packet> {
        Some(packet)
    }

    /// React to the connection (both directions or one) being closed.
    fn close_connection(&mut self, _packet: &mut Packet, _graceful: bool, _both_sides: bool) {}

    /// Delete `length` payload bytes of `packet` at the content-relative
    /// `position`.
    fn remove_bytes(&mut self, _packet: &mut Packet, _position: usize, _length: usize) {}

    /// Open a gap of `length` bytes at the content-relative `position`. The
    /// caller fills the gap.
    fn insert_bytes(&mut self, _packet: &mut Packet, _position: usize, _length: usize) {}

    /// The layer above holds `packet` back and needs more data to decide.
    fn request_more_packets(&mut self, _packet: &Packet) {}

    /// Mark the packet as modified so checksums are finalized on emission.
    fn set_dirty(&mut self, packet: &mut Packet) {
        packet.set_dirty(true);
    }
}

/// An explicit, ordered pipeline of stack elements.
///
/// Forwarding an operation means invoking it on every element in order; the
/// chain itself implements [`StackElement`], so a chain can stand wherever a
/// single element can (in particular as the `owner` of flow-buffer edits).
///
/// [`StackElement`]: trait.StackElement.html
pub struct Chain<'a, 'e> {
    elements: &'a mut [&'e mut dyn StackElement],
}

impl<'a, 'e> Chain<'a, 'e> {
    pub fn new(elements: &'a mut [&'e mut dyn StackElement]) -> Self {
        Chain { elements }
    }
}

impl StackElement for Chain<'_, '_> {
    fn process(&mut self, packet: Packet) -> Option<Packet> {
        let mut packet = Some(packet);
        for element in self.elements.iter_mut() {
            packet = element.process(packet?);
        }
        packet
    }

    fn close_connection(&mut self, packet: &mut Packet, graceful: bool, both_sides: bool) {
        for element in self.elements.iter_mut() {
            element.close_connection(packet, graceful, both_sides);
        }
    }

    fn remove_bytes(&mut self, packet: &mut Packet, position: usize, length: usize) {
        for element in self.elements.iter_mut() {
            element.remove_bytes(packet, position, length);
        }
    }

    fn insert_bytes(&mut self, packet: &mut Packet, position: usize, length: usize) {
        for element in self.elements.iter_mut() {
            element.insert_bytes(packet, position, length);
        }
    }

    fn request_more_packets(&mut self, packet: &Packet) {
        for element in self.elements.iter_mut() {
            element.request_more_packets(packet);
        }
    }

    fn set_dirty(&mut self, packet: &mut Packet) {
        for element in self.elements.iter_mut() {
            element.set_dirty(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Ipv4Address, SeqNumber, TcpFlags};

    #[derive(Default)]
    struct Recorder {
        removals: usize,
        dirtied: usize,
    }

    impl StackElement for Recorder {
        fn remove_bytes(&mut self, _packet: &mut Packet, _position: usize, _length: usize) {
            self.removals += 1;
        }

        fn set_dirty(&mut self, packet: &mut Packet) {
            packet.set_dirty(true);
            self.dirtied += 1;
        }
    }

    #[test]
    fn chain_forwards_to_every_element() {
        let mut first = Recorder::default();
        let mut second = Recorder::default();
        let mut packet = Packet::forge(
            Ipv4Address::new(10, 0, 0, 1),
            Ipv4Address::new(10, 0, 0, 2),
            40000,
            80,
            SeqNumber(1001),
            None,
            8192,
            TcpFlags::default(),
            b"payload",
        );

        {
            let mut elements: [&mut dyn StackElement; 2] = [&mut first, &mut second];
            let mut chain = Chain::new(&mut elements);
            chain.remove_bytes(&mut packet, 0, 1);
            chain.set_dirty(&mut packet);
        }

        assert_eq!((first.removals, second.removals), (1, 1));
        assert_eq!((first.dirtied, second.dirtied), (1, 1));
        assert!(packet.is_dirty());
    }
}
