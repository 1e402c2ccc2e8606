use crate::bucket::BucketList;
use crate::core::{ConsumeBucketResult, FdTypeMask, Istream, IstreamHandler, TerminationState};
use bytes::Bytes;
use sb_core::PipelineError;

/// Source istream over an in-memory buffer. Grounds the zero-copy bucket
/// path: `fill_bucket_list` hands out the remaining bytes without copying.
pub struct MemoryIstream {
    data: Bytes,
    state: TerminationState,
}

impl MemoryIstream {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            state: TerminationState::default(),
        }
    }
}

impl Istream for MemoryIstream {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.state.is_live() {
            return;
        }
        if self.data.is_empty() {
            self.state.mark_eof();
            handler.on_eof();
            return;
        }
        let consumed = handler.on_data(&self.data);
        debug_assert!(consumed <= self.data.len());
        let _ = self.data.split_to(consumed);
        if self.data.is_empty() {
            self.state.mark_eof();
            handler.on_eof();
        }
    }

    fn get_available(&self, _partial: bool) -> i64 {
        self.data.len() as i64
    }

    fn skip(&mut self, n: u64) -> i64 {
        let n = (n as usize).min(self.data.len());
        let _ = self.data.split_to(n);
        n as i64
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        list.push_buffer(self.data.clone());
        list.set_more(false);
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        let n = n.min(self.data.len());
        let _ = self.data.split_to(n);
        ConsumeBucketResult {
            consumed: n,
            eof: self.data.is_empty(),
        }
    }

    fn close(&mut self) {
        self.state.mark_closed();
    }
}

/// Immediate-EOF source; used as `Optional`'s discard target and in tests.
pub struct NullIstream {
    state: TerminationState,
    delivered: bool,
}

impl NullIstream {
    pub fn new() -> Self {
        Self {
            state: TerminationState::default(),
            delivered: false,
        }
    }
}

impl Default for NullIstream {
    fn default() -> Self {
        Self::new()
    }
}

impl Istream for NullIstream {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.state.is_live() || self.delivered {
            return;
        }
        self.delivered = true;
        self.state.mark_eof();
        handler.on_eof();
    }

    fn get_available(&self, _partial: bool) -> i64 {
        0
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        list.set_more(false);
    }

    fn consume_bucket_list(&mut self, _n: usize) -> ConsumeBucketResult {
        ConsumeBucketResult { consumed: 0, eof: true }
    }

    fn close(&mut self) {
        self.state.mark_closed();
    }
}

/// Truncates the upstream to the first `n` bytes, then forces EOF —
/// spec §4.1 supplement `HeadIstream`.
pub struct HeadIstream<I> {
    upstream: I,
    remaining: u64,
    state: TerminationState,
}

impl<I: Istream> HeadIstream<I> {
    pub fn new(upstream: I, n: u64) -> Self {
        Self {
            upstream,
            remaining: n,
            state: TerminationState::default(),
        }
    }
}

struct HeadAdapter<'a> {
    remaining: &'a mut u64,
    inner: &'a mut dyn IstreamHandler,
    hit_limit: &'a mut bool,
}

impl<'a> IstreamHandler for HeadAdapter<'a> {
    fn on_data(&mut self, data: &[u8]) -> usize {
        let allowed = (*self.remaining).min(data.len() as u64) as usize;
        if allowed == 0 {
            *self.hit_limit = true;
            return data.len();
        }
        let consumed = self.inner.on_data(&data[..allowed]);
        *self.remaining -= consumed as u64;
        if *self.remaining == 0 {
            *self.hit_limit = true;
        }
        consumed
    }

    fn on_eof(&mut self) {
        self.inner.on_eof();
    }

    fn on_error(&mut self, error: sb_core::PipelineError) {
        self.inner.on_error(error);
    }
}

impl<I: Istream> Istream for HeadIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.state.is_live() {
            return;
        }
        if self.remaining == 0 {
            self.state.mark_eof();
            handler.on_eof();
            return;
        }
        let mut hit_limit = false;
        {
            let mut adapter = HeadAdapter {
                remaining: &mut self.remaining,
                inner: handler,
                hit_limit: &mut hit_limit,
            };
            self.upstream.read(&mut adapter);
        }
        if hit_limit && self.state.is_live() {
            self.upstream.close();
            self.state.mark_eof();
            handler.on_eof();
        }
    }

    fn get_available(&self, partial: bool) -> i64 {
        let up = self.upstream.get_available(partial);
        if up < 0 {
            if partial {
                -1
            } else {
                self.remaining as i64
            }
        } else {
            (up as u64).min(self.remaining) as i64
        }
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        let mut upstream_list = BucketList::new();
        self.upstream.fill_bucket_list(&mut upstream_list);
        let mut budget = self.remaining;
        for bucket in upstream_list.buckets() {
            if budget == 0 {
                break;
            }
            match bucket {
                crate::bucket::Bucket::Buffer(b) => {
                    let take = (budget as usize).min(b.len());
                    list.push_buffer(b.slice(0..take));
                    budget -= take as u64;
                }
                crate::bucket::Bucket::NonBuffer { len } => {
                    let take = (budget as usize).min(*len);
                    list.push_non_buffer(take);
                    budget -= take as u64;
                }
            }
        }
        list.set_more(budget > 0 && upstream_list.has_more());
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        let n = (n as u64).min(self.remaining) as usize;
        let result = self.upstream.consume_bucket_list(n);
        self.remaining -= result.consumed as u64;
        ConsumeBucketResult {
            consumed: result.consumed,
            eof: self.remaining == 0 || result.eof,
        }
    }

    fn close(&mut self) {
        self.upstream.close();
        self.state.mark_closed();
    }

    fn direct_mask(&self) -> FdTypeMask {
        FdTypeMask::empty()
    }
}

/// Placeholder for a body producer that doesn't exist yet — spec §4.1
/// supplement `DelayedIstream`/`HoldIstream`, used where the resource
/// loader must commit to a response (status, headers) before the body
/// istream is available. [`set_upstream`](Self::set_upstream) attaches
/// the real stream once it is ready; reads before that return nothing.
pub struct DelayedIstream<I> {
    upstream: Option<I>,
    error: Option<PipelineError>,
    state: TerminationState,
}

impl<I: Istream> DelayedIstream<I> {
    pub fn new() -> Self {
        Self {
            upstream: None,
            error: None,
            state: TerminationState::default(),
        }
    }

    pub fn set_upstream(&mut self, upstream: I) {
        debug_assert!(self.upstream.is_none(), "upstream already attached");
        self.upstream = Some(upstream);
    }

    /// Fails the istream before an upstream is ever attached.
    pub fn set_error(&mut self, error: PipelineError) {
        self.error = Some(error);
    }

    pub fn is_attached(&self) -> bool {
        self.upstream.is_some()
    }
}

impl<I: Istream> Default for DelayedIstream<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Istream> Istream for DelayedIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.state.is_live() {
            return;
        }
        if let Some(e) = self.error.take() {
            self.state.mark_error();
            handler.on_error(e);
            return;
        }
        if let Some(up) = &mut self.upstream {
            up.read(handler);
        }
    }

    fn get_available(&self, partial: bool) -> i64 {
        self.upstream.as_ref().map(|u| u.get_available(partial)).unwrap_or(-1)
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        match &mut self.upstream {
            Some(up) => up.fill_bucket_list(list),
            None => list.set_more(true),
        }
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        match &mut self.upstream {
            Some(up) => up.consume_bucket_list(n),
            None => ConsumeBucketResult {
                consumed: 0,
                eof: false,
            },
        }
    }

    fn close(&mut self) {
        if let Some(up) = &mut self.upstream {
            up.close();
        }
        self.state.mark_closed();
    }

    fn direct_mask(&self) -> FdTypeMask {
        self.upstream.as_ref().map(|u| u.direct_mask()).unwrap_or(FdTypeMask::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::CollectHandler;

    #[test]
    fn test_memory_istream_delivers_all_then_eof() {
        let mut s = MemoryIstream::new(Bytes::from_static(b"foobar"));
        let mut h = CollectHandler::default();
        s.read(&mut h);
        assert_eq!(h.data, b"foobar");
        assert!(h.eof);
    }

    #[test]
    fn test_memory_istream_partial_consume_retains_remainder() {
        let mut s = MemoryIstream::new(Bytes::from_static(b"foobar"));
        let mut h = CollectHandler {
            max_take: Some(3),
            ..Default::default()
        };
        s.read(&mut h);
        assert_eq!(h.data, b"foo");
        assert!(!h.eof);
        s.read(&mut h);
        assert_eq!(h.data, b"foobar");
        assert!(h.eof);
    }

    #[test]
    fn test_head_istream_truncates() {
        let mem = MemoryIstream::new(Bytes::from_static(b"abcdefgh"));
        let mut s = HeadIstream::new(mem, 3);
        let mut h = CollectHandler::default();
        s.read(&mut h);
        assert_eq!(h.data, b"abc");
        assert!(h.eof);
    }

    #[test]
    fn test_null_istream_is_immediate_eof() {
        let mut s = NullIstream::new();
        let mut h = CollectHandler::default();
        s.read(&mut h);
        assert!(h.data.is_empty());
        assert!(h.eof);
    }

    #[test]
    fn test_delayed_istream_withholds_until_attached() {
        let mut s: DelayedIstream<MemoryIstream> = DelayedIstream::new();
        let mut h = CollectHandler::default();
        s.read(&mut h);
        assert!(h.data.is_empty());
        assert!(!h.eof);
        s.set_upstream(MemoryIstream::new(Bytes::from_static(b"xyz")));
        s.read(&mut h);
        assert_eq!(h.data, b"xyz");
        assert!(h.eof);
    }
}
