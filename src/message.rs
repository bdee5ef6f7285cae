//! Diagnostic message frames and chains.
//!
//! A message keeps both an allocation and an advanceable view into it, so
//! a consumer can strip headers without losing the ability to free the
//! buffer. Here the allocation is an `Arc<Vec<u8>>` and the cursor is a
//! `Range<usize>`; advancing the view is just narrowing the range, and
//! `Drop` handles the rest.

use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

/// Format-flag bitset carried alongside a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fmt(u8);

impl Fmt {
    pub const FRAMED: Fmt = Fmt(0x01);
    pub const DATA_ONLY: Fmt = Fmt(0x02);
    pub const CKSUMMED: Fmt = Fmt(0x04);
    pub const BAD_CS: Fmt = Fmt(0x08);

    pub const fn empty() -> Self {
        Fmt(0)
    }

    pub fn contains(self, other: Fmt) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Fmt) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Fmt) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Fmt {
    type Output = Fmt;
    fn bitor(self, rhs: Fmt) -> Fmt {
        Fmt(self.0 | rhs.0)
    }
}

/// A single diagnostic frame, with an optional chain continuation for
/// multi-block telegrams (KWP1281) or split-overlong messages (ISO 9141).
#[derive(Debug, Clone)]
pub struct Message {
    pub fmt: Fmt,
    pub ty: u8,
    pub src: u8,
    pub dest: u8,
    pub rxtime: Instant,
    origin: Arc<Vec<u8>>,
    view: Range<usize>,
    pub next: Option<Box<Message>>,
}

impl Message {
    /// Allocate a new owned message with `len` zeroed payload bytes,
    /// mirroring `diag_allocmsg`.
    pub fn alloc(len: usize) -> Self {
        Message {
            fmt: Fmt::empty(),
            ty: 0,
            src: 0,
            dest: 0,
            rxtime: Instant::now(),
            origin: Arc::new(vec![0u8; len]),
            view: 0..len,
            next: None,
        }
    }

    /// Build a message from existing bytes (e.g. freshly read off the wire).
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let len = data.len();
        Message {
            fmt: Fmt::empty(),
            ty: 0,
            src: 0,
            dest: 0,
            rxtime: Instant::now(),
            origin: Arc::new(data),
            view: 0..len,
            next: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.origin[self.view.clone()]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let origin = Arc::make_mut(&mut self.origin);
        &mut origin[self.view.clone()]
    }

    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// Advance the view's start by `n` bytes without touching the
    /// underlying allocation — the Rust analogue of `msg->idata += n`.
    pub fn advance(&mut self, n: usize) {
        self.view.start = (self.view.start + n).min(self.view.end);
    }

    /// Truncate the view to `n` bytes from its current start.
    pub fn truncate(&mut self, n: usize) {
        self.view.end = (self.view.start + n).min(self.view.end);
    }

    /// Split off a duplicate of `self` containing only the first
    /// `at` bytes of the current view, and shrink `self` to the remainder:
    /// used to break an overlong message into chunks, each a duplicate of
    /// the original trimmed to the max frame length and chained in order.
    pub fn split_prefix(&mut self, at: usize) -> Message {
        let mut head = self.dup_single();
        head.truncate(at);
        self.advance(at);
        head
    }

    /// Deep structural duplicate of this single message (no chain).
    /// Mirrors `diag_dupsinglemsg`.
    pub fn dup_single(&self) -> Message {
        Message {
            fmt: self.fmt,
            ty: self.ty,
            src: self.src,
            dest: self.dest,
            rxtime: self.rxtime,
            origin: self.origin.clone(),
            view: self.view.clone(),
            next: None,
        }
    }

    /// Deep structural duplicate of the whole chain. Mirrors `diag_dupmsg`.
    pub fn dup(&self) -> Message {
        let mut head = self.dup_single();
        head.next = self.next.as_ref().map(|n| Box::new(n.dup()));
        head
    }

    /// Append `other` as the new tail of this chain.
    pub fn push_back(&mut self, other: Message) {
        let mut cur = self;
        while cur.next.is_some() {
            cur = cur.next.as_mut().unwrap();
        }
        cur.next = Some(Box::new(other));
    }

    /// Iterate the chain, head first.
    pub fn iter(&self) -> MessageIter<'_> {
        MessageIter { cur: Some(self) }
    }
}

pub struct MessageIter<'a> {
    cur: Option<&'a Message>,
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = &'a Message;
    fn next(&mut self) -> Option<&'a Message> {
        let cur = self.cur.take()?;
        self.cur = cur.next.as_deref();
        Some(cur)
    }
}

/// Sum-mod-256 checksum over `data`, matching `diag_cks1`.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trip_law() {
        let mut buf = vec![0x68, 0x6A, 0x10, 0xAA, 0x55];
        let cs = checksum(&buf);
        buf.push(cs);
        assert_eq!(checksum(&buf), 0);
    }

    #[test]
    fn dup_dup_is_structurally_equal() {
        let mut m = Message::from_bytes(vec![1, 2, 3, 4]);
        m.src = 0x10;
        m.dest = 0xF1;
        let twice = m.dup().dup();
        assert_eq!(twice.data(), m.data());
        assert_eq!(twice.src, m.src);
        assert_eq!(twice.dest, m.dest);
        assert_eq!(twice.len(), m.len());
    }

    #[test]
    fn advance_narrows_view_without_reallocating() {
        let mut m = Message::from_bytes(vec![0x48, 0x6B, 0x10, 0xAA, 0xBB]);
        m.advance(3);
        assert_eq!(m.data(), &[0xAA, 0xBB]);
    }

    #[test]
    fn split_prefix_concatenates_back_to_original() {
        let mut m = Message::from_bytes((0..20u8).collect());
        let head = m.split_prefix(11);
        let mut combined = head.data().to_vec();
        combined.extend_from_slice(m.data());
        assert_eq!(combined, (0..20u8).collect::<Vec<u8>>());
    }

    #[test]
    fn chain_iterates_head_first() {
        let mut m = Message::from_bytes(vec![1]);
        m.push_back(Message::from_bytes(vec![2]));
        m.push_back(Message::from_bytes(vec![3]));
        let collected: Vec<u8> = m.iter().map(|x| x.data()[0]).collect();
        assert_eq!(collected, vec![1, 2, 3]);
    }
}
