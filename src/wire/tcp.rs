use core::{cmp, fmt, ops};
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};
use super::ipv4::{checksum, Address};

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2<sup>32</sup>.
/// Sequence numbers do not have a discontiguity when compared pairwise across
/// a signed overflow.
///
/// The `Ord` implementation is the same wrapping comparison. It is a total
/// order only while all compared values lie within one half of the sequence
/// space; the stream maintainer's pruning watermark upholds that window for
/// every value this crate keeps alive.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub i32);

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl SeqNumber {
    /// Construct from the host representation of a raw wire value.
    pub fn from_u32(raw: u32) -> Self {
        SeqNumber(raw as i32)
    }

    /// The raw wire value.
    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }

    /// Displace by a signed number of bytes, wrapping in sequence space.
    pub fn offset(self, delta: i64) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(delta as i32))
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        if rhs > i32::max_value() as usize {
            panic!("attempt to add to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_add(rhs as i32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        if rhs > i32::max_value() as usize {
            panic!("attempt to subtract from sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_sub(rhs as i32))
    }
}

impl ops::Sub for SeqNumber {
    type Output = usize;

    fn sub(self, rhs: SeqNumber) -> usize {
        let result = self.0.wrapping_sub(rhs.0);
        if result < 0 {
            panic!("attempt to subtract sequence numbers with underflow")
        }
        result as usize
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl cmp::Ord for SeqNumber {
    fn cmp(&self, other: &SeqNumber) -> cmp::Ordering {
        self.0.wrapping_sub(other.0).cmp(&0)
    }
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::Field;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM:  Field = 4..8;
    pub const ACK_NUM:  Field = 8..12;
    pub const FLAGS:    Field = 12..14;
    pub const WIN_SIZE: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT:   Field = 18..20;

    pub const FLG_FIN: u16 = 0x001;
    pub const FLG_SYN: u16 = 0x002;
    pub const FLG_RST: u16 = 0x004;
    pub const FLG_PSH: u16 = 0x008;
    pub const FLG_ACK: u16 = 0x010;
}

/// A set of tcp flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(pub u16);

impl Flags {
    /// Return the FIN flag.
    #[inline]
    pub fn fin(&self) -> bool {
        self.0 & field::FLG_FIN != 0
    }

    /// Return the SYN flag.
    #[inline]
    pub fn syn(&self) -> bool {
        self.0 & field::FLG_SYN != 0
    }

    /// Return the RST flag.
    #[inline]
    pub fn rst(&self) -> bool {
        self.0 & field::FLG_RST != 0
    }

    /// Return the PSH flag.
    #[inline]
    pub fn psh(&self) -> bool {
        self.0 & field::FLG_PSH != 0
    }

    /// Return the ACK flag.
    #[inline]
    pub fn ack(&self) -> bool {
        self.0 & field::FLG_ACK != 0
    }

    /// Set the FIN flag.
    #[inline]
    pub fn set_fin(&mut self, value: bool) {
        let flag = if value { field::FLG_FIN } else { 0 };
        self.0 = (self.0 & !field::FLG_FIN) | flag;
    }

    /// Set the SYN flag.
    #[inline]
    pub fn set_syn(&mut self, value: bool) {
        let flag = if value { field::FLG_SYN } else { 0 };
        self.0 = (self.0 & !field::FLG_SYN) | flag;
    }

    /// Set the RST flag.
    #[inline]
    pub fn set_rst(&mut self, value: bool) {
        let flag = if value { field::FLG_RST } else { 0 };
        self.0 = (self.0 & !field::FLG_RST) | flag;
    }

    /// Set the ACK flag.
    #[inline]
    pub fn set_ack(&mut self, value: bool) {
        let flag = if value { field::FLG_ACK } else { 0 };
        self.0 = (self.0 & !field::FLG_ACK) | flag;
    }

    /// Whether the flag combination is exactly a bare acknowledgement.
    pub fn is_just_ack(&self) -> bool {
        self.0 == field::FLG_ACK
    }

    /// The sequence space occupied by the flags themselves.
    ///
    /// SYN and FIN each count for one.
    pub fn sequence_len(&self) -> usize {
        usize::from(self.syn()) + usize::from(self.fin())
    }
}

byte_wrapper! {
    /// A TCP segment, viewed in place over its raw octets.
    ///
    /// Contrary to other layers there is no memoized representation: the
    /// middlebox reads a field, rewrites it in place, and moves on. All
    /// accessors are panic-free after [`check_len`] succeeded and while the
    /// header length field is not shrunk below the fixed header.
    ///
    /// [`check_len`]: #method.check_len
    tcp_packet
}

impl tcp_packet {
    /// Imbue a raw octet buffer with TCP packet structure.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Imbue a mutable raw octet buffer with TCP packet structure.
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
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is too short.
    /// Returns `Err(Error::Malformed)` if the header length field has a value
    /// smaller than the minimal header length.
    pub fn check_len(&self) -> Result<()> {
        let len = self.0.len();
        if len < field::URGENT.end {
            Err(Error::Truncated)
        } else {
            let header_len = usize::from(self.header_len());
            if len < header_len {
                Err(Error::Truncated)
            } else if header_len < field::URGENT.end {
                Err(Error::Malformed)
            } else {
                Ok(())
            }
        }
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.0[field::SEQ_NUM]))
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.0[field::ACK_NUM]))
    }

    /// Read all flags at once.
    pub fn flags(&self) -> Flags {
        Flags(NetworkEndian::read_u16(&self.0[field::FLAGS]) & 0x1ff)
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        let raw = NetworkEndian::read_u16(&self.0[field::FLAGS]);
        ((raw >> 12) * 4) as u8
    }

    /// Return the window size field.
    #[inline]
    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the length of the segment, in terms of sequence space.
    pub fn sequence_len(&self) -> usize {
        self.0.len() - usize::from(self.header_len()) + self.flags().sequence_len()
    }

    /// Return the TCP payload of the segment.
    pub fn payload_slice(&self) -> &[u8] {
        &self.0[usize::from(self.header_len())..]
    }

    /// Validate the packet checksum against the IPv4 pseudo header.
    pub fn verify_checksum(&self, src_addr: Address, dst_addr: Address) -> bool {
        checksum::combine(&[
            checksum::pseudo_header(&src_addr, &dst_addr, self.0.len() as u32),
            checksum::data(&self.0),
        ]) == !0
    }

    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.0[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.0[field::ACK_NUM], value.0)
    }

    /// Set a combination of flags, leaving the header length untouched.
    #[inline]
    pub fn set_flags(&mut self, Flags(flags): Flags) {
        let raw = NetworkEndian::read_u16(&self.0[field::FLAGS]) & !0x0fff;
        NetworkEndian::write_u16(&mut self.0[field::FLAGS], raw | (flags & 0x1ff))
    }

    /// Set the header length, in octets.
    #[inline]
    pub fn set_header_len(&mut self, value: u8) {
        let raw = NetworkEndian::read_u16(&self.0[field::FLAGS]);
        let raw = (raw & !0xf000) | (u16::from(value) / 4) << 12;
        NetworkEndian::write_u16(&mut self.0[field::FLAGS], raw)
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Compute and fill in the checksum over the IPv4 pseudo header.
    pub fn fill_checksum(&mut self, src_addr: Address, dst_addr: Address) {
        self.set_checksum(0);
        let value = !checksum::combine(&[
            checksum::pseudo_header(&src_addr, &dst_addr, self.0.len() as u32),
            checksum::data(&self.0),
        ]);
        self.set_checksum(value)
    }

    /// Return a mutable pointer to the payload data.
    #[inline]
    pub fn payload_mut_slice(&mut self) -> &mut [u8] {
        let header_len = usize::from(self.header_len());
        &mut self.0[header_len..]
    }
}

/// A high-level representation of a TCP header, for forging control packets.
///
/// Emitted headers never carry options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repr {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: SeqNumber,
    pub ack_number: Option<SeqNumber>,
    pub flags: Flags,
    pub window_len: u16,
}

impl Repr {
    /// The length of the emitted header, in octets.
    pub fn header_len(&self) -> usize {
        field::URGENT.end
    }

    /// Emit this header into the front of `buffer`.
    ///
    /// The checksum is left zero; fill it once the enclosing IP addresses are
    /// known.
    ///
    /// # Panics
    /// Panics if the buffer is shorter than `header_len()`.
    pub fn emit(&self, buffer: &mut [u8]) {
        let mut flags = self.flags;
        flags.set_ack(self.ack_number.is_some());

        let packet = tcp_packet::new_unchecked_mut(buffer);
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_flags(flags);
        packet.set_header_len(self.header_len() as u8);
        packet.set_window_len(self.window_len);
        packet.set_checksum(0);
        NetworkEndian::write_u16(&mut packet.0[field::URGENT], 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_number_wrapping() {
        let near_wrap = SeqNumber::from_u32(0xffff_fff0);
        let wrapped = near_wrap + 0x20;
        assert!(near_wrap < wrapped);
        assert_eq!(wrapped - near_wrap, 0x20);
        assert_eq!(near_wrap.offset(0x20), wrapped);
        assert_eq!(wrapped.offset(-0x20), near_wrap);
    }

    #[test]
    fn flags_round_trip() {
        let mut flags = Flags::default();
        flags.set_syn(true);
        flags.set_ack(true);
        assert!(flags.syn() && flags.ack());
        assert!(!flags.is_just_ack());
        assert_eq!(flags.sequence_len(), 1);
        flags.set_syn(false);
        assert!(flags.is_just_ack());
        assert_eq!(flags.sequence_len(), 0);
    }

    #[test]
    fn emit_and_read_back() {
        let repr = Repr {
            src_port: 443,
            dst_port: 61000,
            seq_number: SeqNumber(5000),
            ack_number: Some(SeqNumber(1001)),
            flags: {
                let mut flags = Flags::default();
                flags.set_syn(true);
                flags
            },
            window_len: 8192,
        };

        let mut buffer = alloc::vec![0u8; repr.header_len()];
        repr.emit(&mut buffer);

        let packet = tcp_packet::new_checked(&buffer[..]).unwrap();
        assert_eq!(packet.src_port(), 443);
        assert_eq!(packet.dst_port(), 61000);
        assert_eq!(packet.seq_number(), SeqNumber(5000));
        assert_eq!(packet.ack_number(), SeqNumber(1001));
        assert!(packet.flags().syn());
        assert!(packet.flags().ack());
        assert_eq!(usize::from(packet.header_len()), repr.header_len());
        assert_eq!(packet.sequence_len(), 1);
        assert!(packet.payload_slice().is_empty());
    }

    #[test]
    fn checksum_round_trip() {
        let src = Address::new(192, 0, 2, 1);
        let dst = Address::new(192, 0, 2, 2);
        let repr = Repr {
            src_port: 80,
            dst_port: 54321,
            seq_number: SeqNumber(1),
            ack_number: None,
            flags: Flags::default(),
            window_len: 100,
        };

        let mut buffer = alloc::vec![0u8; repr.header_len() + 4];
        repr.emit(&mut buffer);
        buffer[20..].copy_from_slice(b"data");

        tcp_packet::new_unchecked_mut(&mut buffer[..]).fill_checksum(src, dst);
        let packet = tcp_packet::new_unchecked(&buffer[..]);
        assert!(packet.verify_checksum(src, dst));
    }

    #[test]
    fn malformed_header_len() {
        let mut buffer = [0u8; 20];
        // Header length nibble of 1 claims a 4-octet header.
        buffer[12] = 0x10;
        assert_eq!(tcp_packet::new_checked(&buffer[..]).unwrap_err(), Error::Malformed);
        assert_eq!(tcp_packet::new_checked(&buffer[..10]).unwrap_err(), Error::Truncated);
    }
}
