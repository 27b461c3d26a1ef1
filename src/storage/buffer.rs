use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::layer::StackElement;
use crate::packet::Packet;

/// Outcome of a pattern search over buffered content.
///
/// The middlebox cannot always decide on the packets it has: a pattern may
/// begin in the last buffered bytes and complete in a packet still in
/// flight. The ternary result makes that case explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// The pattern occurs wholly inside the buffered content.
    Found,

    /// Not found, but a non-empty proper prefix of the pattern matches the
    /// tail of the buffered content. Buffer more packets and retry.
    Pending,

    /// Not found, and no occurrence can begin in the buffered content.
    Absent,
}

/// A position inside the buffered content.
///
/// Addresses one payload byte as `(packet index, offset behind the packet's
/// content offset)`. Cursors are plain indices: they are invalidated by
/// dequeueing packets in front of them, and must be re-normalized (see
/// [`repair`]) after deletions shrink the packet they point into.
///
/// [`repair`]: struct.FlowBuffer.html#method.repair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentCursor {
    packet: usize,
    offset: usize,
}

impl ContentCursor {
    /// Index of the packet this cursor points into.
    pub fn packet_index(&self) -> usize {
        self.packet
    }

    /// Content-relative offset within that packet.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// A FIFO of owned packets exposing their payload as one contiguous stream.
///
/// Packets are held in sequence order. Byte-level operations cross packet
/// boundaries transparently; the physical packets are re-emitted (dequeued)
/// once a decision about them has been made.
#[derive(Debug, Default)]
pub struct FlowBuffer {
    packets: VecDeque<Packet>,
}

impl FlowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet at the end of the buffer.
    pub fn enqueue(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    /// Append a whole batch in order.
    pub fn enqueue_all(&mut self, batch: impl IntoIterator<Item = Packet>) {
        self.packets.extend(batch);
    }

    /// Remove and return the packet at the front.
    pub fn dequeue(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    /// Remove and return all packets, in order.
    pub fn dequeue_all(&mut self) -> Vec<Packet> {
        self.packets.drain(..).collect()
    }

    /// Remove and return every packet strictly before `index`.
    pub fn dequeue_up_to(&mut self, index: usize) -> Vec<Packet> {
        self.packets.drain(..index.min(self.packets.len())).collect()
    }

    /// Remove and return every packet wholly processed up to the cursor.
    ///
    /// With no cursor the entire buffer drains.
    pub fn flush(&mut self, cursor: Option<ContentCursor>) -> Vec<Packet> {
        match cursor {
            Some(cursor) => self.dequeue_up_to(cursor.packet),
            None => self.dequeue_all(),
        }
    }

    /// Number of buffered packets.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Iterate the buffered packets front to back.
    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    /// Access one buffered packet.
    pub fn get(&self, index: usize) -> Option<&Packet> {
        self.packets.get(index)
    }

    /// A cursor at the first content byte, starting `pos_in_first` bytes
    /// into the first packet. `None` if the buffer holds no content there.
    pub fn content_begin(&self, pos_in_first: usize) -> Option<ContentCursor> {
        self.normalize(ContentCursor { packet: 0, offset: pos_in_first })
    }

    /// Move a cursor one content byte forward.
    pub fn advance(&self, cursor: ContentCursor) -> Option<ContentCursor> {
        self.normalize(ContentCursor { packet: cursor.packet, offset: cursor.offset + 1 })
    }

    /// Re-validate a cursor after deletions may have emptied packet tails.
    ///
    /// A cursor whose offset ran off the end of its (shrunken) packet is
    /// moved to the first content byte of the following packets.
    pub fn repair(&self, cursor: ContentCursor) -> Option<ContentCursor> {
        self.normalize(cursor)
    }

    /// The byte under the cursor.
    ///
    /// # Panics
    /// Panics if the cursor does not address buffered content; normalized
    /// cursors always do.
    pub fn byte_at(&self, cursor: ContentCursor) -> u8 {
        self.packets[cursor.packet].content()[cursor.offset]
    }

    fn normalize(&self, mut cursor: ContentCursor) -> Option<ContentCursor> {
        loop {
            let packet = self.packets.get(cursor.packet)?;
            if cursor.offset < packet.content_len() {
                return Some(cursor);
            }
            cursor.offset -= packet.content_len();
            cursor.packet += 1;
        }
    }

    /// Search the buffered content for `pattern`.
    pub fn search_in_flow(&self, pattern: &[u8]) -> SearchResult {
        self.search_from(self.content_begin(0), pattern).0
    }

    fn search_from(
        &self,
        start: Option<ContentCursor>,
        pattern: &[u8],
    ) -> (SearchResult, Option<ContentCursor>) {
        assert!(!pattern.is_empty());

        let mut start = match start {
            Some(start) => start,
            None => return (SearchResult::Absent, None),
        };

        loop {
            let mut position = Some(start);
            let mut matched = 0;

            while matched < pattern.len() {
                let at = match position {
                    Some(at) => at,
                    // Content ran out mid-match: a proper prefix sits at the
                    // buffered tail.
                    None => return (SearchResult::Pending, None),
                };
                if self.byte_at(at) != pattern[matched] {
                    break;
                }
                matched += 1;
                position = self.advance(at);
            }

            if matched == pattern.len() {
                return (SearchResult::Found, Some(start));
            }

            start = match self.advance(start) {
                Some(next) => next,
                None => return (SearchResult::Absent, None),
            };
        }
    }

    /// Find the first occurrence of `pattern` and delete it.
    ///
    /// The deletion spans however many packets the pattern does; each
    /// affected packet goes through the owner's `remove_bytes` hook so the
    /// edit is recorded per original packet.
    pub fn remove_in_flow(
        &mut self,
        pattern: &[u8],
        owner: &mut dyn StackElement,
    ) -> SearchResult {
        let (result, found) = self.search_from(self.content_begin(0), pattern);
        if let Some(cursor) = found {
            self.remove_at(cursor, pattern.len(), owner);
        }
        result
    }

    /// Find the first occurrence of `pattern` and replace it.
    ///
    /// The common byte prefix of pattern and replacement is overwritten in
    /// place; the length difference is inserted or deleted at the divergence
    /// point; the rest of the replacement overwrites from there. The net
    /// delta reaches the sequence bookkeeping through the owner's hooks.
    pub fn replace_in_flow(
        &mut self,
        pattern: &[u8],
        replacement: &[u8],
        owner: &mut dyn StackElement,
    ) -> SearchResult {
        let (result, found) = self.search_from(self.content_begin(0), pattern);
        let cursor = match found {
            Some(cursor) => cursor,
            None => return result,
        };

        let prefix = pattern.iter()
            .zip(replacement)
            .take_while(|(a, b)| a == b)
            .count();

        let (packet, offset) = self.position_after(cursor, prefix);

        if replacement.len() > pattern.len() {
            owner.insert_bytes(&mut self.packets[packet], offset, replacement.len() - pattern.len());
        } else if replacement.len() < pattern.len() {
            let at = self.repair(ContentCursor { packet, offset })
                .expect("divergence point is inside buffered content");
            self.remove_at(at, pattern.len() - replacement.len(), owner);
        }

        self.overwrite(packet, offset, &replacement[prefix..], owner);
        result
    }

    /// Delete `length` content bytes starting at `cursor`.
    fn remove_at(
        &mut self,
        cursor: ContentCursor,
        length: usize,
        owner: &mut dyn StackElement,
    ) {
        let mut packet = cursor.packet;
        let mut offset = cursor.offset;
        let mut remaining = length;

        while remaining > 0 {
            let available = self.packets[packet].content_len() - offset;
            let chunk = available.min(remaining);
            if chunk > 0 {
                owner.remove_bytes(&mut self.packets[packet], offset, chunk);
                remaining -= chunk;
            }
            if remaining > 0 {
                packet += 1;
                offset = 0;
                assert!(packet < self.packets.len(), "deletion exceeds buffered content");
            }
        }
    }

    /// Overwrite buffered content with `bytes`, starting at the possibly
    /// end-of-packet position `(packet, offset)`.
    fn overwrite(
        &mut self,
        mut packet: usize,
        mut offset: usize,
        mut bytes: &[u8],
        owner: &mut dyn StackElement,
    ) {
        while !bytes.is_empty() {
            assert!(packet < self.packets.len(), "overwrite exceeds buffered content");
            let available = self.packets[packet].content_len() - offset;
            let chunk = available.min(bytes.len());
            if chunk > 0 {
                let target = &mut self.packets[packet].content_mut()[offset..offset + chunk];
                target.copy_from_slice(&bytes[..chunk]);
                owner.set_dirty(&mut self.packets[packet]);
                bytes = &bytes[chunk..];
            }
            if !bytes.is_empty() {
                packet += 1;
                offset = 0;
            }
        }
    }

    /// The position `steps` content bytes behind `cursor`.
    ///
    /// Packet boundaries normalize to the head of the following packet, like
    /// iteration does; only at the very end of the buffered content may the
    /// result address the one-past-the-end position of the last packet (an
    /// insertion point there is an append).
    fn position_after(&self, cursor: ContentCursor, steps: usize) -> (usize, usize) {
        let mut packet = cursor.packet;
        let mut offset = cursor.offset + steps;

        loop {
            let len = match self.packets.get(packet) {
                Some(current) => current.content_len(),
                None => break,
            };
            if offset < len {
                break;
            }
            if packet + 1 >= self.packets.len() {
                offset = offset.min(len);
                break;
            }
            offset -= len;
            packet += 1;
        }
        (packet, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ModificationList;
    use crate::wire::{Ipv4Address, SeqNumber, TcpFlags};

    /// A bare-bones owner: applies byte moves and records the hook calls,
    /// standing in for the connection tracker's operator.
    #[derive(Default)]
    struct Editor {
        removed: Vec<(SeqNumber, i32)>,
        inserted: Vec<(SeqNumber, i32)>,
    }

    impl StackElement for Editor {
        fn remove_bytes(&mut self, packet: &mut Packet, position: usize, length: usize) {
            let at = packet.seq_number()
                + (packet.content_offset() + position - packet.payload_offset());
            self.removed.push((at, -(length as i32)));
            packet.remove_content(position, length);
            packet.set_dirty(true);
        }

        fn insert_bytes(&mut self, packet: &mut Packet, position: usize, length: usize) {
            let at = packet.seq_number()
                + (packet.content_offset() + position - packet.payload_offset());
            self.inserted.push((at, length as i32));
            packet.insert_content(position, length);
            packet.set_dirty(true);
        }

        fn set_dirty(&mut self, packet: &mut Packet) {
            packet.set_dirty(true);
        }
    }

    fn data_packet(seq: u32, payload: &[u8]) -> Packet {
        let mut flags = TcpFlags::default();
        flags.set_ack(true);
        Packet::forge(
            Ipv4Address::new(10, 0, 0, 1),
            Ipv4Address::new(10, 0, 0, 2),
            40000,
            80,
            SeqNumber::from_u32(seq),
            Some(SeqNumber(5001)),
            8192,
            flags,
            payload,
        )
    }

    fn contents(buffer: &FlowBuffer) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut cursor = buffer.content_begin(0);
        while let Some(at) = cursor {
            bytes.push(buffer.byte_at(at));
            cursor = buffer.advance(at);
        }
        bytes
    }

    #[test]
    fn fifo_conservation() {
        let mut buffer = FlowBuffer::new();
        let seqs = [1000u32, 1010, 1020];
        buffer.enqueue_all(seqs.iter().map(|&seq| data_packet(seq, b"0123456789")));

        let batch = buffer.dequeue_all();
        assert_eq!(batch.len(), 3);
        for (packet, &seq) in batch.iter().zip(&seqs) {
            assert_eq!(packet.seq_number(), SeqNumber::from_u32(seq));
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn dequeue_up_to_is_strictly_before() {
        let mut buffer = FlowBuffer::new();
        buffer.enqueue(data_packet(1000, b"AA"));
        buffer.enqueue(data_packet(1002, b"BB"));
        buffer.enqueue(data_packet(1004, b"CC"));

        let front = buffer.dequeue_up_to(2);
        assert_eq!(front.len(), 2);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(0).unwrap().content(), b"CC");
    }

    #[test]
    fn content_iteration_skips_empty_packets() {
        let mut buffer = FlowBuffer::new();
        buffer.enqueue(data_packet(1000, b"AB"));
        buffer.enqueue(data_packet(1002, b""));
        buffer.enqueue(data_packet(1002, b"CD"));
        assert_eq!(contents(&buffer), b"ABCD".to_vec());
    }

    #[test]
    fn search_ternary_semantics() {
        let mut buffer = FlowBuffer::new();
        buffer.enqueue(data_packet(1001, b"FOO"));
        buffer.enqueue(data_packet(1004, b"BAR"));

        // Wholly inside one packet, spanning both, and at the very end.
        assert_eq!(buffer.search_in_flow(b"FO"), SearchResult::Found);
        assert_eq!(buffer.search_in_flow(b"OOBA"), SearchResult::Found);
        assert_eq!(buffer.search_in_flow(b"BAR"), SearchResult::Found);

        // "ARC": "AR" matches the tail, decision needs the next packet.
        assert_eq!(buffer.search_in_flow(b"ARC"), SearchResult::Pending);

        // Cannot begin anywhere in the buffered bytes.
        assert_eq!(buffer.search_in_flow(b"XYZ"), SearchResult::Absent);
    }

    #[test]
    fn remove_spanning_packets() {
        let mut buffer = FlowBuffer::new();
        buffer.enqueue(data_packet(1001, b"AAABBB"));
        buffer.enqueue(data_packet(1007, b"CCCDDD"));

        let mut editor = Editor::default();
        assert_eq!(buffer.remove_in_flow(b"BBBCCC", &mut editor), SearchResult::Found);
        assert_eq!(contents(&buffer), b"AAADDD".to_vec());
        assert_eq!(buffer.get(0).unwrap().content(), b"AAA");
        assert_eq!(buffer.get(1).unwrap().content(), b"DDD");
        // One recorded deletion per affected packet, at absolute positions.
        assert_eq!(editor.removed, alloc::vec![
            (SeqNumber(1004), -3),
            (SeqNumber(1007), -3),
        ]);
    }

    #[test]
    fn replace_with_longer_spanning_packets() {
        let mut buffer = FlowBuffer::new();
        buffer.enqueue(data_packet(1001, b"FOO"));
        buffer.enqueue(data_packet(1004, b"BAR"));

        let mut editor = Editor::default();
        let result = buffer.replace_in_flow(b"OOBA", b"OOXYZBA", &mut editor);
        assert_eq!(result, SearchResult::Found);
        assert_eq!(contents(&buffer), b"FOOXYZBAR".to_vec());
        // The +3 lands at the divergence point, the head of packet two.
        assert_eq!(editor.inserted, alloc::vec![(SeqNumber(1004), 3)]);
        assert!(editor.removed.is_empty());
    }

    #[test]
    fn replace_with_shorter() {
        let mut buffer = FlowBuffer::new();
        buffer.enqueue(data_packet(1001, b"HELLOWORLD"));

        let mut editor = Editor::default();
        let result = buffer.replace_in_flow(b"LOWOR", b"LW", &mut editor);
        assert_eq!(result, SearchResult::Found);
        assert_eq!(contents(&buffer), b"HELLWLD".to_vec());
        assert_eq!(editor.removed, alloc::vec![(SeqNumber(1005), -3)]);
    }

    #[test]
    fn replace_equal_length_only_overwrites() {
        let mut buffer = FlowBuffer::new();
        buffer.enqueue(data_packet(1001, b"GET /index"));

        let mut editor = Editor::default();
        let result = buffer.replace_in_flow(b"index", b"start", &mut editor);
        assert_eq!(result, SearchResult::Found);
        assert_eq!(contents(&buffer), b"GET /start".to_vec());
        assert!(editor.removed.is_empty() && editor.inserted.is_empty());
        assert!(buffer.get(0).unwrap().is_dirty());
    }

    #[test]
    fn repair_after_tail_deletion() {
        let mut buffer = FlowBuffer::new();
        buffer.enqueue(data_packet(1001, b"ABCD"));
        buffer.enqueue(data_packet(1005, b"EF"));

        let mut editor = Editor::default();
        // Delete "CD", the tail of the first packet.
        assert_eq!(buffer.remove_in_flow(b"CD", &mut editor), SearchResult::Found);

        // A cursor that pointed at the old tail now runs off the packet;
        // repair moves it to the next packet's first content byte.
        let stale = ContentCursor { packet: 0, offset: 2 };
        let repaired = buffer.repair(stale).unwrap();
        assert_eq!(repaired.packet_index(), 1);
        assert_eq!(repaired.offset(), 0);
        assert_eq!(buffer.byte_at(repaired), b'E');
    }

    #[test]
    fn recorded_edits_feed_a_modification_list() {
        let mut buffer = FlowBuffer::new();
        buffer.enqueue(data_packet(1001, b"AAABBBCCC"));

        let mut editor = Editor::default();
        buffer.remove_in_flow(b"BBB", &mut editor);

        let mut list = ModificationList::new();
        for &(position, length) in &editor.removed {
            list.add_modification(position, length);
        }
        assert_eq!(list.net_delta(), -3);
    }
}
