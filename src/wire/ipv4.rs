use core::fmt;
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};

/// The transport protocol number of TCP.
pub const PROTOCOL_TCP: u8 = 0x06;

/// A four-octet IPv4 address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Address(pub [u8; 4]);

impl Address {
    /// An unspecified address.
    pub const UNSPECIFIED: Address = Address([0x00; 4]);

    /// Construct an IPv4 address from parts.
    pub fn new(a0: u8, a1: u8, a2: u8, a3: u8) -> Address {
        Address([a0, a1, a2, a3])
    }

    /// Construct an IPv4 address from a sequence of octets, in big-endian.
    ///
    /// # Panics
    /// The function panics if `data` is not four octets long.
    pub fn from_bytes(data: &[u8]) -> Address {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(data);
        Address(bytes)
    }

    /// Return an IPv4 address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.0;
        write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

mod field {
    use crate::wire::Field;

    pub const VER_IHL: usize = 0;
    pub const LENGTH: Field = 2..4;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Field = 10..12;
    pub const SRC_ADDR: Field = 12..16;
    pub const DST_ADDR: Field = 16..20;
}

byte_wrapper! {
    /// An IPv4 packet, viewed in place over its raw octets.
    ///
    /// Every accessor reads the buffer directly; nothing is memoized. The
    /// check performed by [`new_checked`] guarantees the fixed header is
    /// addressable and the header-length nibble is sane.
    ///
    /// [`new_checked`]: #method.new_checked
    ipv4_packet
}

impl ipv4_packet {
    /// Imbue a raw octet buffer with IPv4 packet structure.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Imbue a mutable raw octet buffer with IPv4 packet structure.
    pub fn new_unchecked_mut(data: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(data)
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        let packet = Self::new_unchecked(data);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no header accessor method will panic if called.
    pub fn check_len(&self) -> Result<()> {
        if self.0.len() < field::DST_ADDR.end {
            return Err(Error::Truncated);
        }
        let header_len = self.header_len();
        if header_len < field::DST_ADDR.end || self.0.len() < header_len {
            return Err(Error::Malformed);
        }
        if (self.0[field::VER_IHL] >> 4) != 4 {
            return Err(Error::Malformed);
        }
        if usize::from(self.total_len()) < header_len {
            return Err(Error::Malformed);
        }
        Ok(())
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> usize {
        usize::from(self.0[field::VER_IHL] & 0x0f) * 4
    }

    /// Return the total length field.
    #[inline]
    pub fn total_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::LENGTH])
    }

    /// Return the protocol field.
    #[inline]
    pub fn protocol(&self) -> u8 {
        self.0[field::PROTOCOL]
    }

    /// Return the source address field.
    #[inline]
    pub fn src_addr(&self) -> Address {
        Address::from_bytes(&self.0[field::SRC_ADDR])
    }

    /// Return the destination address field.
    #[inline]
    pub fn dst_addr(&self) -> Address {
        Address::from_bytes(&self.0[field::DST_ADDR])
    }

    /// Set the total length field.
    #[inline]
    pub fn set_total_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::LENGTH], value)
    }

    /// Set the source address field.
    #[inline]
    pub fn set_src_addr(&mut self, value: Address) {
        self.0[field::SRC_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Set the destination address field.
    #[inline]
    pub fn set_dst_addr(&mut self, value: Address) {
        self.0[field::DST_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Compute and fill in the header checksum.
    pub fn fill_checksum(&mut self) {
        let header_len = self.header_len();
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], 0);
        let value = !checksum::data(&self.0[..header_len]);
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }
}

/// A high-level representation of an IPv4 header, for emission only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repr {
    pub src_addr: Address,
    pub dst_addr: Address,
    /// Length of the transport header and payload carried behind this header.
    pub payload_len: usize,
}

impl Repr {
    /// The length of the emitted header, in octets.
    ///
    /// Forged packets never carry options.
    pub fn header_len(&self) -> usize {
        field::DST_ADDR.end
    }

    pub fn buffer_len(&self) -> usize {
        self.header_len() + self.payload_len
    }

    /// Emit this header into the front of `buffer` and fill the checksum.
    ///
    /// # Panics
    /// Panics if the buffer is shorter than `buffer_len()`.
    pub fn emit(&self, buffer: &mut [u8]) {
        assert!(buffer.len() >= self.buffer_len());
        for byte in buffer[..self.header_len()].iter_mut() {
            *byte = 0;
        }
        buffer[field::VER_IHL] = 0x45;
        NetworkEndian::write_u16(&mut buffer[field::LENGTH], self.buffer_len() as u16);
        buffer[field::TTL] = 64;
        buffer[field::PROTOCOL] = PROTOCOL_TCP;
        buffer[field::SRC_ADDR].copy_from_slice(self.src_addr.as_bytes());
        buffer[field::DST_ADDR].copy_from_slice(self.dst_addr.as_bytes());
        ipv4_packet::new_unchecked_mut(buffer).fill_checksum();
    }
}

pub(crate) mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::Address;

    fn fold(sum: u32) -> u16 {
        let folded = (sum >> 16) + (sum & 0xffff);
        ((folded >> 16) as u16) + (folded as u16)
    }

    /// Internet checksum of a byte range, before the final complement.
    ///
    /// Plain 16-bit accumulation; the buffers this crate sums are a handful
    /// of headers, not bulk payload, so there is nothing to win by batching.
    pub(crate) fn data(buffer: &[u8]) -> u16 {
        let mut accum = 0u32;

        let mut words = buffer.chunks_exact(2);
        for word in &mut words {
            accum += u32::from(NetworkEndian::read_u16(word));
        }
        // A trailing odd byte counts as if padded with a zero octet.
        if let Some(&last) = words.remainder().first() {
            accum += u32::from(last) << 8;
        }

        fold(accum)
    }

    /// Sum partial checksums into one.
    pub(crate) fn combine(parts: &[u16]) -> u16 {
        fold(parts.iter().map(|&part| u32::from(part)).sum())
    }

    /// Checksum of the pseudo header covering a TCP segment of `length`
    /// octets between `src_addr` and `dst_addr`.
    pub(crate) fn pseudo_header(src_addr: &Address, dst_addr: &Address, length: u32) -> u16 {
        let mut proto_len = [0u8; 4];
        proto_len[1] = super::PROTOCOL_TCP;
        NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

        combine(&[
            data(src_addr.as_bytes()),
            data(dst_addr.as_bytes()),
            data(&proto_len[..]),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_and_parse() {
        let repr = Repr {
            src_addr: Address::new(10, 0, 0, 1),
            dst_addr: Address::new(10, 0, 0, 2),
            payload_len: 20,
        };
        let mut buffer = alloc::vec![0u8; repr.buffer_len()];
        repr.emit(&mut buffer);

        let packet = ipv4_packet::new_checked(&buffer[..]).unwrap();
        assert_eq!(packet.header_len(), 20);
        assert_eq!(usize::from(packet.total_len()), repr.buffer_len());
        assert_eq!(packet.protocol(), PROTOCOL_TCP);
        assert_eq!(packet.src_addr(), Address::new(10, 0, 0, 1));
        assert_eq!(packet.dst_addr(), Address::new(10, 0, 0, 2));
        // A correct header sums to the complement of zero.
        assert_eq!(checksum::data(&buffer[..20]), !0);
    }

    #[test]
    fn rejects_short_buffers() {
        assert_eq!(ipv4_packet::new_checked(&[0u8; 12][..]).unwrap_err(), Error::Truncated);
    }

    #[test]
    fn rejects_bad_version() {
        let mut buffer = [0u8; 20];
        buffer[0] = 0x65;
        assert_eq!(ipv4_packet::new_checked(&buffer[..]).unwrap_err(), Error::Malformed);
    }

    #[test]
    fn odd_length_checksum() {
        // The dangling byte is padded, not dropped.
        assert_ne!(checksum::data(&[0xab, 0xcd, 0xef]), checksum::data(&[0xab, 0xcd]));
        assert_eq!(checksum::data(&[0xab, 0xcd, 0xef]), checksum::data(&[0xab, 0xcd, 0xef, 0x00]));
    }
}
