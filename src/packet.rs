//! The owned packet buffer moving through the middlebox.
//!
//! A [`Packet`] couples raw octet storage with the annotations the processing
//! layers communicate through: the offsets of the network and transport
//! headers, the *content offset* naming the first byte of application
//! payload, and the *dirty* flag telling the emitter to recompute checksums.
//!
//! Storage is either shared (a cheaply cloned [`Bytes`] as handed in by a
//! capture or driver layer) or unique (a [`BytesMut`]). Byte-level mutation
//! requires uniquification first; [`uniquify`] converts in place, copying at
//! most once, after which all mutators are available.
//!
//! [`Packet`]: struct.Packet.html
//! [`uniquify`]: struct.Packet.html#method.uniquify
use alloc::vec::Vec;
use bytes::{Bytes, BytesMut};
use core::mem;

use crate::wire::{self, ipv4_packet, tcp_packet, Ipv4Address, Ipv4Repr, SeqNumber, TcpFlags, TcpRepr};

enum Buf {
    Shared(Bytes),
    Unique(BytesMut),
}

impl Buf {
    fn as_slice(&self) -> &[u8] {
        match self {
            Buf::Shared(bytes) => &bytes[..],
            Buf::Unique(bytes) => &bytes[..],
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// An owned TCP/IPv4 packet with middlebox annotations.
pub struct Packet {
    buf: Buf,
    transport_offset: usize,
    content_offset: usize,
    dirty: bool,
}

impl Packet {
    /// Parse a raw buffer as an IPv4 packet carrying TCP.
    ///
    /// Validates the framing of both headers and records their offsets.
    /// Anything that fails here is a malformed packet in the sense of the
    /// error policy: the caller drops it and counts.
    pub fn parse(data: impl Into<Bytes>) -> wire::Result<Packet> {
        let data = data.into();

        let ip = ipv4_packet::new_checked(&data[..])?;
        if ip.protocol() != wire::ipv4::PROTOCOL_TCP {
            return Err(wire::Error::Malformed);
        }
        let transport_offset = ip.header_len();
        if usize::from(ip.total_len()) > data.len() {
            return Err(wire::Error::Truncated);
        }

        let tcp = tcp_packet::new_checked(&data[transport_offset..])?;
        let content_offset = transport_offset + usize::from(tcp.header_len());

        Ok(Packet {
            buf: Buf::Shared(data),
            transport_offset,
            content_offset,
            dirty: false,
        })
    }

    /// Forge a packet from whole cloth.
    ///
    /// Used for crafted acknowledgements and closing packets, and by tests to
    /// build scenario traffic. The checksums are filled in.
    pub fn forge(
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        src_port: u16,
        dst_port: u16,
        seq: SeqNumber,
        ack: Option<SeqNumber>,
        window: u16,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Packet {
        let tcp_repr = TcpRepr {
            src_port,
            dst_port,
            seq_number: seq,
            ack_number: ack,
            flags,
            window_len: window,
        };
        let ip_repr = Ipv4Repr {
            src_addr,
            dst_addr,
            payload_len: tcp_repr.header_len() + payload.len(),
        };

        let mut data = Vec::with_capacity(ip_repr.buffer_len());
        data.resize(ip_repr.buffer_len(), 0);
        ip_repr.emit(&mut data);
        let transport_offset = ip_repr.header_len();
        tcp_repr.emit(&mut data[transport_offset..]);
        let content_offset = transport_offset + tcp_repr.header_len();
        data[content_offset..].copy_from_slice(payload);

        tcp_packet::new_unchecked_mut(&mut data[transport_offset..])
            .fill_checksum(src_addr, dst_addr);

        Packet {
            buf: Buf::Unique(BytesMut::from(&data[..])),
            transport_offset,
            content_offset,
            dirty: false,
        }
    }

    /// The whole packet, headers included.
    pub fn data(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// The packet length in octets.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the storage is still shared with other holders.
    pub fn is_shared(&self) -> bool {
        matches!(self.buf, Buf::Shared(_))
    }

    /// Obtain exclusively owned storage, copying if it was shared.
    ///
    /// Must happen before any byte-level mutation; all mutators below call it
    /// implicitly.
    pub fn uniquify(&mut self) {
        let buf = mem::replace(&mut self.buf, Buf::Shared(Bytes::new()));
        self.buf = match buf {
            Buf::Shared(bytes) => Buf::Unique(BytesMut::from(&bytes[..])),
            unique => unique,
        };
    }

    /// The whole packet, mutably. Uniquifies.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.uniquify();
        match &mut self.buf {
            Buf::Unique(bytes) => &mut bytes[..],
            Buf::Shared(_) => unreachable!("buffer was just uniquified"),
        }
    }

    /// Offset of the transport header.
    pub fn transport_offset(&self) -> usize {
        self.transport_offset
    }

    /// Offset of the first TCP payload byte, headers and options included.
    pub fn payload_offset(&self) -> usize {
        let tcp = self.tcp();
        self.transport_offset + usize::from(tcp.header_len())
    }

    /// The content-offset annotation.
    ///
    /// Written by the connection tracker once the TCP header is sized; layers
    /// above address payload bytes relative to this.
    pub fn content_offset(&self) -> usize {
        self.content_offset
    }

    pub fn set_content_offset(&mut self, offset: usize) {
        debug_assert!(offset <= self.len());
        self.content_offset = offset;
    }

    /// The dirty annotation: checksums need recomputation before emission.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// View of the IPv4 header.
    pub fn ip(&self) -> &ipv4_packet {
        ipv4_packet::new_unchecked(self.data())
    }

    /// Mutable view of the IPv4 header. Uniquifies.
    pub fn ip_mut(&mut self) -> &mut ipv4_packet {
        ipv4_packet::new_unchecked_mut(self.data_mut())
    }

    /// View of the TCP header.
    pub fn tcp(&self) -> &tcp_packet {
        let offset = self.transport_offset;
        tcp_packet::new_unchecked(&self.data()[offset..])
    }

    /// Mutable view of the TCP header. Uniquifies.
    pub fn tcp_mut(&mut self) -> &mut tcp_packet {
        let offset = self.transport_offset;
        tcp_packet::new_unchecked_mut(&mut self.data_mut()[offset..])
    }

    /// The application payload behind the content offset.
    pub fn content(&self) -> &[u8] {
        &self.data()[self.content_offset..]
    }

    /// The application payload, mutably. Uniquifies.
    pub fn content_mut(&mut self) -> &mut [u8] {
        let offset = self.content_offset;
        &mut self.data_mut()[offset..]
    }

    /// Number of application payload bytes.
    pub fn content_len(&self) -> usize {
        self.len() - self.content_offset
    }

    /// Number of TCP payload bytes.
    pub fn payload_len(&self) -> usize {
        self.len() - self.payload_offset()
    }

    /// Shrink the packet by `length` octets at the tail, fixing the IP total
    /// length. Uniquifies.
    pub fn take(&mut self, length: usize) {
        assert!(length <= self.payload_len());
        self.uniquify();
        let new_len = self.len() - length;
        match &mut self.buf {
            Buf::Unique(bytes) => bytes.truncate(new_len),
            Buf::Shared(_) => unreachable!("buffer was just uniquified"),
        }
        let total = new_len as u16;
        self.ip_mut().set_total_len(total);
    }

    /// Grow the packet by `length` zeroed octets at the tail, fixing the IP
    /// total length. Uniquifies.
    pub fn put(&mut self, length: usize) {
        self.uniquify();
        let new_len = self.len() + length;
        match &mut self.buf {
            Buf::Unique(bytes) => bytes.resize(new_len, 0),
            Buf::Shared(_) => unreachable!("buffer was just uniquified"),
        }
        let total = new_len as u16;
        self.ip_mut().set_total_len(total);
    }

    /// Delete `length` content bytes at the content-relative `position`,
    /// moving the tail down and shrinking the packet.
    pub fn remove_content(&mut self, position: usize, length: usize) {
        let abs = self.content_offset + position;
        assert!(abs + length <= self.len());
        let len = self.len();
        self.data_mut().copy_within(abs + length..len, abs);
        self.take(length);
    }

    /// Open a gap of `length` bytes at the content-relative `position`,
    /// growing the packet and moving the tail up.
    ///
    /// The gap keeps whatever bytes the move left behind; the caller fills
    /// it.
    pub fn insert_content(&mut self, position: usize, length: usize) {
        let abs = self.content_offset + position;
        let old_len = self.len();
        assert!(abs <= old_len);
        self.put(length);
        self.data_mut().copy_within(abs..old_len, abs + length);
    }

    // Convenience header accessors, so processing code does not thread wire
    // views everywhere.

    pub fn seq_number(&self) -> SeqNumber {
        self.tcp().seq_number()
    }

    pub fn ack_number(&self) -> SeqNumber {
        self.tcp().ack_number()
    }

    pub fn flags(&self) -> TcpFlags {
        self.tcp().flags()
    }

    pub fn window_len(&self) -> u16 {
        self.tcp().window_len()
    }

    pub fn src_addr(&self) -> Ipv4Address {
        self.ip().src_addr()
    }

    pub fn dst_addr(&self) -> Ipv4Address {
        self.ip().dst_addr()
    }

    pub fn src_port(&self) -> u16 {
        self.tcp().src_port()
    }

    pub fn dst_port(&self) -> u16 {
        self.tcp().dst_port()
    }

    /// The sequence number following this segment, flags included.
    pub fn next_seq_number(&self) -> SeqNumber {
        self.seq_number() + self.tcp().sequence_len()
    }

    /// Recompute the TCP and IP checksums and clear the dirty annotation.
    pub fn fill_checksums(&mut self) {
        let src = self.src_addr();
        let dst = self.dst_addr();
        self.tcp_mut().fill_checksum(src, dst);
        self.ip_mut().fill_checksum();
        self.dirty = false;
    }
}

impl Clone for Packet {
    fn clone(&self) -> Packet {
        Packet {
            buf: match &self.buf {
                Buf::Shared(bytes) => Buf::Shared(bytes.clone()),
                Buf::Unique(bytes) => Buf::Unique(bytes.clone()),
            },
            transport_offset: self.transport_offset,
            content_offset: self.content_offset,
            dirty: self.dirty,
        }
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("transport_offset", &self.transport_offset)
            .field("content_offset", &self.content_offset)
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        let mut flags = TcpFlags::default();
        flags.set_ack(true);
        Packet::forge(
            Ipv4Address::new(10, 0, 0, 1),
            Ipv4Address::new(10, 0, 0, 2),
            40000,
            80,
            SeqNumber(1001),
            Some(SeqNumber(5001)),
            8192,
            flags,
            b"HELLOWORLD",
        )
    }

    #[test]
    fn forge_layout() {
        let packet = sample();
        assert_eq!(packet.len(), 20 + 20 + 10);
        assert_eq!(packet.transport_offset(), 20);
        assert_eq!(packet.payload_offset(), 40);
        assert_eq!(packet.content_offset(), 40);
        assert_eq!(packet.content(), b"HELLOWORLD");
        assert_eq!(packet.payload_len(), 10);
        assert_eq!(packet.seq_number(), SeqNumber(1001));
        assert_eq!(packet.ack_number(), SeqNumber(5001));
        assert!(packet.flags().ack());
        assert!(packet.tcp().verify_checksum(packet.src_addr(), packet.dst_addr()));
    }

    #[test]
    fn parse_round_trip() {
        let forged = sample();
        let reparsed = Packet::parse(Bytes::copy_from_slice(forged.data())).unwrap();
        assert!(reparsed.is_shared());
        assert_eq!(reparsed.content(), b"HELLOWORLD");
        assert_eq!(reparsed.payload_offset(), forged.payload_offset());
    }

    #[test]
    fn parse_rejects_non_tcp() {
        let mut data = sample().data().to_vec();
        data[9] = 17; // UDP
        assert_eq!(Packet::parse(data).unwrap_err(), wire::Error::Malformed);
    }

    #[test]
    fn uniquify_copies_once() {
        let forged = sample();
        let mut packet = Packet::parse(Bytes::copy_from_slice(forged.data())).unwrap();
        assert!(packet.is_shared());
        packet.uniquify();
        assert!(!packet.is_shared());
        packet.content_mut()[0] = b'h';
        assert_eq!(&packet.content()[..5], b"hELLO");
    }

    #[test]
    fn content_edits_move_tails() {
        let mut packet = sample();
        packet.remove_content(2, 3);
        assert_eq!(packet.content(), b"HEWORLD");
        assert_eq!(usize::from(packet.ip().total_len()), packet.len());

        packet.insert_content(2, 3);
        assert_eq!(packet.content_len(), 10);
        assert_eq!(&packet.content()[..2], b"HE");
        assert_eq!(&packet.content()[5..], b"WORLD");
    }

    #[test]
    fn take_and_put_fix_total_len() {
        let mut packet = sample();
        packet.take(3);
        assert_eq!(packet.content(), b"HELLOWO");
        assert_eq!(usize::from(packet.ip().total_len()), packet.len());
        packet.put(3);
        assert_eq!(packet.content_len(), 10);
        assert_eq!(&packet.content()[..7], b"HELLOWO");
        assert_eq!(usize::from(packet.ip().total_len()), packet.len());
    }
}
