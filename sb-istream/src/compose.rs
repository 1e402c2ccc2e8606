use crate::bucket::BucketList;
use crate::core::{ConsumeBucketResult, FdTypeMask, Istream, IstreamHandler, TerminationState};
use sb_core::PipelineError;

/// Fires a callback on EOF, error, or close without altering data — spec
/// §4.1 supplement `NotifyIstream`, used for access-log completion hooks.
pub struct NotifyIstream<I, F: FnMut(NotifyOutcome)> {
    upstream: I,
    on_finish: Option<F>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Eof,
    Error,
    Closed,
}

impl<I: Istream, F: FnMut(NotifyOutcome)> NotifyIstream<I, F> {
    pub fn new(upstream: I, on_finish: F) -> Self {
        Self {
            upstream,
            on_finish: Some(on_finish),
        }
    }

    fn fire(&mut self, outcome: NotifyOutcome) {
        if let Some(mut f) = self.on_finish.take() {
            f(outcome);
        }
    }
}

struct NotifyAdapter<'a> {
    inner: &'a mut dyn IstreamHandler,
    outcome: &'a mut Option<NotifyOutcome>,
}

impl<'a> IstreamHandler for NotifyAdapter<'a> {
    fn on_data(&mut self, data: &[u8]) -> usize {
        self.inner.on_data(data)
    }

    fn on_eof(&mut self) {
        *self.outcome = Some(NotifyOutcome::Eof);
        self.inner.on_eof();
    }

    fn on_error(&mut self, error: PipelineError) {
        *self.outcome = Some(NotifyOutcome::Error);
        self.inner.on_error(error);
    }
}

impl<I: Istream, F: FnMut(NotifyOutcome)> Istream for NotifyIstream<I, F> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        let mut outcome = None;
        {
            let mut adapter = NotifyAdapter {
                inner: handler,
                outcome: &mut outcome,
            };
            self.upstream.read(&mut adapter);
        }
        if let Some(o) = outcome {
            self.fire(o);
        }
    }

    fn get_available(&self, partial: bool) -> i64 {
        self.upstream.get_available(partial)
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        self.upstream.fill_bucket_list(list);
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        let result = self.upstream.consume_bucket_list(n);
        if result.eof {
            self.fire(NotifyOutcome::Eof);
        }
        result
    }

    fn close(&mut self) {
        self.upstream.close();
        self.fire(NotifyOutcome::Closed);
    }

    fn direct_mask(&self) -> FdTypeMask {
        self.upstream.direct_mask()
    }
}

/// Concatenates a fixed sequence of istreams, switching to the next on EOF
/// of the current one — spec §4.1 supplement `ConcatIstream`, the
/// mechanism underlying `Replace`'s "prefix + substitution + suffix"
/// emission model in the original implementation.
pub struct ConcatIstream<I> {
    parts: std::collections::VecDeque<I>,
    state: TerminationState,
}

impl<I: Istream> ConcatIstream<I> {
    pub fn new(parts: impl IntoIterator<Item = I>) -> Self {
        Self {
            parts: parts.into_iter().collect(),
            state: TerminationState::default(),
        }
    }
}

struct ConcatAdapter<'a> {
    inner: &'a mut dyn IstreamHandler,
    current_eof: &'a mut bool,
}

impl<'a> IstreamHandler for ConcatAdapter<'a> {
    fn on_data(&mut self, data: &[u8]) -> usize {
        self.inner.on_data(data)
    }

    fn on_eof(&mut self) {
        *self.current_eof = true;
    }

    fn on_error(&mut self, error: PipelineError) {
        self.inner.on_error(error);
    }
}

impl<I: Istream> Istream for ConcatIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.state.is_live() {
            return;
        }
        loop {
            let Some(front) = self.parts.front_mut() else {
                self.state.mark_eof();
                handler.on_eof();
                return;
            };
            let mut current_eof = false;
            {
                let mut adapter = ConcatAdapter {
                    inner: handler,
                    current_eof: &mut current_eof,
                };
                front.read(&mut adapter);
            }
            if current_eof {
                self.parts.pop_front();
                continue;
            }
            return;
        }
    }

    fn get_available(&self, partial: bool) -> i64 {
        if !partial {
            return -1;
        }
        self.parts.front().map(|p| p.get_available(true)).unwrap_or(0)
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        if let Some(front) = self.parts.front_mut() {
            front.fill_bucket_list(list);
            if self.parts.len() > 1 {
                list.set_more(true);
            }
        } else {
            list.set_more(false);
        }
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        if let Some(front) = self.parts.front_mut() {
            let result = front.consume_bucket_list(n);
            if result.eof && self.parts.len() > 1 {
                self.parts.pop_front();
                return ConsumeBucketResult {
                    consumed: result.consumed,
                    eof: false,
                };
            }
            ConsumeBucketResult {
                consumed: result.consumed,
                eof: result.eof && self.parts.len() <= 1,
            }
        } else {
            ConsumeBucketResult {
                consumed: 0,
                eof: true,
            }
        }
    }

    fn close(&mut self) {
        for mut p in self.parts.drain(..) {
            p.close();
        }
        self.state.mark_closed();
    }
}

/// Absorbs upstream errors and substitutes a fixed tail istream in their
/// place — spec §4.1 `CatchIstream`. Per SPEC_FULL.md §4.1, also pads any
/// previously-advertised-but-undelivered `GetAvailable` bytes with spaces
/// before emitting the substitution, so a declared Content-Length is
/// honored even on mid-stream failure.
pub struct CatchIstream<I, T> {
    upstream: Option<I>,
    tail: Option<T>,
    advertised_remaining: i64,
    delivered: i64,
    pad: Vec<u8>,
    pad_pos: usize,
    state: TerminationState,
}

impl<I: Istream, T: Istream> CatchIstream<I, T> {
    pub fn new(upstream: I, tail: T) -> Self {
        let advertised_remaining = upstream.get_available(true).max(0);
        Self {
            upstream: Some(upstream),
            tail: Some(tail),
            advertised_remaining,
            delivered: 0,
            pad: Vec::new(),
            pad_pos: 0,
            state: TerminationState::default(),
        }
    }
}

struct CatchAdapter<'a> {
    inner: &'a mut dyn IstreamHandler,
    delivered: &'a mut i64,
    error: &'a mut Option<PipelineError>,
    eof: &'a mut bool,
}

impl<'a> IstreamHandler for CatchAdapter<'a> {
    fn on_data(&mut self, data: &[u8]) -> usize {
        let consumed = self.inner.on_data(data);
        *self.delivered += consumed as i64;
        consumed
    }

    fn on_eof(&mut self) {
        *self.eof = true;
    }

    fn on_error(&mut self, error: PipelineError) {
        *self.error = Some(error);
    }
}

impl<I: Istream, T: Istream> Istream for CatchIstream<I, T> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.state.is_live() {
            return;
        }

        if self.pad_pos < self.pad.len() {
            let consumed = handler.on_data(&self.pad[self.pad_pos..]);
            self.pad_pos += consumed;
            if self.pad_pos < self.pad.len() {
                return;
            }
        }

        if let Some(up) = &mut self.upstream {
            let mut error = None;
            let mut eof = false;
            {
                let mut adapter = CatchAdapter {
                    inner: handler,
                    delivered: &mut self.delivered,
                    error: &mut error,
                    eof: &mut eof,
                };
                up.read(&mut adapter);
            }
            if eof {
                if let Some(mut u) = self.upstream.take() {
                    u.close();
                }
                self.state.mark_eof();
                handler.on_eof();
                return;
            }
            if let Some(_e) = error {
                if let Some(mut u) = self.upstream.take() {
                    u.close();
                }
                let shortfall = (self.advertised_remaining - self.delivered).max(0) as usize;
                if shortfall > 0 {
                    self.pad = vec![b' '; shortfall];
                    self.pad_pos = 0;
                    let consumed = handler.on_data(&self.pad);
                    self.pad_pos += consumed;
                    if self.pad_pos < self.pad.len() {
                        return;
                    }
                }
                return;
            }
            return;
        }

        if let Some(tail) = &mut self.tail {
            struct TailAdapter<'a> {
                inner: &'a mut dyn IstreamHandler,
                eof: &'a mut bool,
            }
            impl<'a> IstreamHandler for TailAdapter<'a> {
                fn on_data(&mut self, data: &[u8]) -> usize {
                    self.inner.on_data(data)
                }
                fn on_eof(&mut self) {
                    *self.eof = true;
                }
                fn on_error(&mut self, error: PipelineError) {
                    self.inner.on_error(error);
                }
            }
            let mut eof = false;
            {
                let mut adapter = TailAdapter {
                    inner: handler,
                    eof: &mut eof,
                };
                tail.read(&mut adapter);
            }
            if eof {
                self.tail = None;
                self.state.mark_eof();
                handler.on_eof();
            }
        }
    }

    fn get_available(&self, _partial: bool) -> i64 {
        -1
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        list.set_more(self.upstream.is_some() || self.tail.is_some() || self.pad_pos < self.pad.len());
    }

    fn consume_bucket_list(&mut self, _n: usize) -> ConsumeBucketResult {
        ConsumeBucketResult {
            consumed: 0,
            eof: self.upstream.is_none() && self.tail.is_none() && self.pad_pos >= self.pad.len(),
        }
    }

    fn close(&mut self) {
        if let Some(mut up) = self.upstream.take() {
            up.close();
        }
        if let Some(mut tail) = self.tail.take() {
            tail.close();
        }
        self.state.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryIstream;
    use crate::test_util::{drain, CollectHandler};
    use bytes::Bytes;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_notify_fires_once_on_eof() {
        let mem = MemoryIstream::new(Bytes::from_static(b"ab"));
        let fired = Rc::new(RefCell::new(Vec::new()));
        let fired2 = fired.clone();
        let s = NotifyIstream::new(mem, move |o| fired2.borrow_mut().push(o));
        let h = drain(s);
        assert_eq!(h.data, b"ab");
        assert_eq!(*fired.borrow(), vec![NotifyOutcome::Eof]);
    }

    #[test]
    fn test_concat_switches_on_eof() {
        let a = MemoryIstream::new(Bytes::from_static(b"foo"));
        let b = MemoryIstream::new(Bytes::from_static(b"bar"));
        let s = ConcatIstream::new(vec![a, b]);
        let h = drain(s);
        assert_eq!(h.data, b"foobar");
    }

    #[test]
    fn test_catch_pads_shortfall_with_spaces() {
        let mut inject = crate::flow::InjectIstream::new();
        inject.inject_error(PipelineError::Internal("boom".into()));
        // Pretend the upstream had advertised 10 bytes remaining before failing.
        struct Advertised(crate::flow::InjectIstream, i64);
        impl Istream for Advertised {
            fn read(&mut self, h: &mut dyn IstreamHandler) {
                self.0.read(h)
            }
            fn get_available(&self, _partial: bool) -> i64 {
                self.1
            }
            fn fill_bucket_list(&mut self, list: &mut BucketList) {
                self.0.fill_bucket_list(list)
            }
            fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
                self.0.consume_bucket_list(n)
            }
            fn close(&mut self) {
                self.0.close()
            }
        }
        let upstream = Advertised(inject, 10);
        let tail = crate::source::NullIstream::new();
        let mut s = CatchIstream::new(upstream, tail);
        let mut h = CollectHandler::default();
        s.read(&mut h);
        assert_eq!(h.data, vec![b' '; 10]);
    }
}
