//! Low-level packet access and construction.
//!
//! The `wire` module deals with the packet *representation*. The lowercase
//! structures, [`ipv4_packet`] and [`tcp_packet`], view a header in place
//! over its raw octets: a reference to one is a reference into the packet
//! buffer itself, reads and writes go straight to the wire bytes. Since this
//! crate rewrites headers of packets in flight, nothing is memoized. Field
//! offsets live in a private `field` module per header type; the small
//! `Repr` structs exist only to emit forged control packets.
//!
//! [`ipv4_packet`]: ipv4/struct.ipv4_packet.html
//! [`tcp_packet`]: tcp/struct.tcp_packet.html

use core::fmt;

pub mod ipv4;
pub mod tcp;

pub use ipv4::{ipv4_packet, Address as Ipv4Address, Repr as Ipv4Repr};
pub use tcp::{tcp_packet, Flags as TcpFlags, Repr as TcpRepr, SeqNumber};

/// Type alias for a field of a packet header, a range of octets.
pub(crate) type Field = core::ops::Range<usize>;

pub type Result<T> = core::result::Result<T, Error>;

/// The error type for parsing and wire representations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// The packet is shorter than its headers claim.
    Truncated,

    /// A header field has an impossible value.
    Malformed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated packet"),
            Error::Malformed => write!(f, "malformed header"),
        }
    }
}
