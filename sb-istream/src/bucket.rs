use bytes::Bytes;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BucketFlags: u8 {
        /// More buckets may arrive after this list ends.
        const HAS_MORE       = 0b0001;
        /// The segment after the buffered buckets would require a splice
        /// (a non-buffer transfer) rather than an in-memory read.
        const HAS_NON_BUFFER = 0b0010;
        /// Caller should push more even though the buffer is non-empty
        /// (used by sources that batch small buckets).
        const PUSH_MORE      = 0b0100;
        /// A fallback path should be used instead of bucket enumeration.
        const FALLBACK       = 0b1000;
    }
}

/// One entry of a [`BucketList`]. Buckets are *borrowed* views into
/// upstream buffers — spec §9 "Bucket list semantics": the list does not
/// own the buffers, upstream must not hand out the same bytes twice.
#[derive(Debug, Clone)]
pub enum Bucket {
    Buffer(Bytes),
    /// A splice-only segment of `len` bytes that cannot be enumerated as a
    /// buffer; a text-only consumer should stop here (see `HAS_NON_BUFFER`).
    NonBuffer { len: usize },
}

/// Ordered, zero-copy enumeration of what an istream could deliver without
/// advancing (spec §3 `Istream bucket list`).
#[derive(Debug, Clone, Default)]
pub struct BucketList {
    buckets: Vec<Bucket>,
    flags: BucketFlags,
}

impl BucketList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_buffer(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.buckets.push(Bucket::Buffer(data));
        }
    }

    pub fn push_non_buffer(&mut self, len: usize) {
        if len > 0 {
            self.buckets.push(Bucket::NonBuffer { len });
            self.flags |= BucketFlags::HAS_NON_BUFFER;
        }
    }

    pub fn set_more(&mut self, more: bool) {
        self.flags.set(BucketFlags::HAS_MORE, more);
    }

    pub fn has_more(&self) -> bool {
        self.flags.contains(BucketFlags::HAS_MORE)
    }

    pub fn has_non_buffer(&self) -> bool {
        self.flags.contains(BucketFlags::HAS_NON_BUFFER)
    }

    pub fn flags(&self) -> BucketFlags {
        self.flags
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Total bytes representable as buffers (excludes non-buffer segments),
    /// i.e. the amount a text-only consumer could take without a splice.
    pub fn buffer_bytes(&self) -> usize {
        self.buckets
            .iter()
            .take_while(|b| matches!(b, Bucket::Buffer(_)))
            .map(|b| match b {
                Bucket::Buffer(b) => b.len(),
                Bucket::NonBuffer { .. } => 0,
            })
            .sum()
    }

    /// True once this list ends with no more buckets pending and no
    /// trailing non-buffer segment — spec §3 invariant: upstream is then at
    /// EOF (nothing further will ever be enumerated).
    pub fn is_exhausted(&self) -> bool {
        !self.has_more() && !self.has_non_buffer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_bytes_stops_at_non_buffer() {
        let mut list = BucketList::new();
        list.push_buffer(Bytes::from_static(b"abc"));
        list.push_non_buffer(5);
        list.push_buffer(Bytes::from_static(b"xyz"));
        assert_eq!(list.buffer_bytes(), 3);
    }

    #[test]
    fn test_exhausted_iff_no_more_and_no_non_buffer() {
        let mut list = BucketList::new();
        assert!(list.is_exhausted());
        list.set_more(true);
        assert!(!list.is_exhausted());
        list.set_more(false);
        list.push_non_buffer(4);
        assert!(!list.is_exhausted());
    }

    #[test]
    fn test_empty_buffers_are_not_pushed() {
        let mut list = BucketList::new();
        list.push_buffer(Bytes::new());
        assert!(list.is_empty());
    }
}
