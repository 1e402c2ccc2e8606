use crate::bucket::BucketList;
use crate::core::{ConsumeBucketResult, FdTypeMask, Istream, IstreamHandler, TerminationState};
use bytes::{Bytes, BytesMut};
use sb_core::PipelineError;

/// Opaque handle to a pending substitution, returned by [`ReplaceIstream::add`].
/// `extend`/`finish` take this handle rather than a raw offset, so a caller
/// cannot accidentally target the wrong substitution by misremembering its
/// `start` (see SPEC_FULL.md §9 open-question decision on `Extend`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubstitutionHandle(usize);

struct Substitution {
    start: u64,
    end: u64,
    content: Bytes,
    settled: bool,
}

/// Tracks partial progress through a substitution once its content starts
/// flowing to the handler, across possibly many `read()` calls.
struct ActiveSub {
    content: Bytes,
    content_sent: usize,
    skip_remaining: u64,
}

/// Splices caller-supplied replacement content into ranges of the upstream
/// byte stream (spec §4.1 `ReplaceIstream`, example in spec §8.6).
///
/// Substitutions must be added in non-decreasing, non-overlapping `start`
/// order (`end` of one must not exceed the `start` of the next). Bytes
/// upstream of the earliest *unsettled* substitution's start can always be
/// emitted; bytes at or past that point are withheld until the caller
/// calls [`finish`](Self::finish) on it, since `extend` may still move its
/// `end` forward.
pub struct ReplaceIstream<I> {
    upstream: I,
    buffered: BytesMut,
    upstream_eof: bool,
    cursor: u64,
    subs: Vec<Substitution>,
    next_sub: usize,
    active: Option<ActiveSub>,
    state: TerminationState,
}

impl<I: Istream> ReplaceIstream<I> {
    pub fn new(upstream: I) -> Self {
        Self {
            upstream,
            buffered: BytesMut::new(),
            upstream_eof: false,
            cursor: 0,
            subs: Vec::new(),
            next_sub: 0,
            active: None,
            state: TerminationState::default(),
        }
    }

    pub fn add(&mut self, start: u64, end: u64, content: impl Into<Bytes>) -> SubstitutionHandle {
        debug_assert!(
            self.subs.last().map(|s| s.end <= start).unwrap_or(true),
            "substitutions must be added in non-decreasing, non-overlapping order"
        );
        let handle = SubstitutionHandle(self.subs.len());
        self.subs.push(Substitution {
            start,
            end,
            content: content.into(),
            settled: false,
        });
        handle
    }

    pub fn extend(&mut self, handle: SubstitutionHandle, new_end: u64) -> Result<(), PipelineError> {
        let sub = self
            .subs
            .get_mut(handle.0)
            .ok_or_else(|| PipelineError::Internal("unknown substitution handle".into()))?;
        if sub.settled {
            return Err(PipelineError::Internal(
                "cannot extend an already-finished substitution".into(),
            ));
        }
        sub.end = sub.end.max(new_end);
        Ok(())
    }

    pub fn finish(&mut self, handle: SubstitutionHandle) -> Result<(), PipelineError> {
        let sub = self
            .subs
            .get_mut(handle.0)
            .ok_or_else(|| PipelineError::Internal("unknown substitution handle".into()))?;
        sub.settled = true;
        Ok(())
    }

    /// Start offset of the earliest substitution not yet finished, if any.
    fn earliest_unsettled_start(&self) -> Option<u64> {
        self.subs[self.next_sub..]
            .iter()
            .find(|s| !s.settled)
            .map(|s| s.start)
    }

    /// Push buffered/substitution content to `handler` until blocked on a
    /// partial consume, an unsettled substitution, or exhausted input.
    fn pump(&mut self, handler: &mut dyn IstreamHandler) {
        loop {
            if let Some(active) = &mut self.active {
                if active.content_sent < active.content.len() {
                    let remaining = active.content.slice(active.content_sent..);
                    let consumed = handler.on_data(&remaining);
                    active.content_sent += consumed;
                    if consumed < remaining.len() {
                        return;
                    }
                }
                if active.skip_remaining > 0 {
                    let take = active.skip_remaining.min(self.buffered.len() as u64) as usize;
                    if take > 0 {
                        let _ = self.buffered.split_to(take);
                        self.cursor += take as u64;
                        active.skip_remaining -= take as u64;
                    }
                    if active.skip_remaining > 0 {
                        return;
                    }
                }
                self.next_sub += 1;
                self.active = None;
                continue;
            }

            let Some(sub) = self.subs.get(self.next_sub) else {
                if self.buffered.is_empty() {
                    return;
                }
                let chunk = self.buffered.split_to(self.buffered.len()).freeze();
                let consumed = handler.on_data(&chunk);
                self.cursor += consumed as u64;
                if consumed < chunk.len() {
                    self.buffered = BytesMut::from(&chunk[consumed..]);
                    return;
                }
                continue;
            };

            if self.cursor < sub.start {
                let plain_len = (sub.start - self.cursor).min(self.buffered.len() as u64) as usize;
                if plain_len == 0 {
                    return;
                }
                let chunk = self.buffered.split_to(plain_len).freeze();
                let consumed = handler.on_data(&chunk);
                self.cursor += consumed as u64;
                if consumed < chunk.len() {
                    let mut rest = BytesMut::from(&chunk[consumed..]);
                    rest.extend_from_slice(&self.buffered);
                    self.buffered = rest;
                    return;
                }
                continue;
            }

            if !sub.settled {
                return;
            }

            self.active = Some(ActiveSub {
                content: sub.content.clone(),
                content_sent: 0,
                skip_remaining: sub.end - sub.start,
            });
        }
    }
}

impl<I: Istream> Istream for ReplaceIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.state.is_live() {
            return;
        }
        if !self.upstream_eof {
            struct Buffer<'a> {
                buffered: &'a mut BytesMut,
                eof: &'a mut bool,
            }
            impl<'a> IstreamHandler for Buffer<'a> {
                fn on_data(&mut self, data: &[u8]) -> usize {
                    self.buffered.extend_from_slice(data);
                    data.len()
                }
                fn on_eof(&mut self) {
                    *self.eof = true;
                }
                fn on_error(&mut self, _error: PipelineError) {}
            }
            let mut buf = Buffer {
                buffered: &mut self.buffered,
                eof: &mut self.upstream_eof,
            };
            self.upstream.read(&mut buf);
        }

        self.pump(handler);

        if self.upstream_eof
            && self.buffered.is_empty()
            && self.active.is_none()
            && self.next_sub >= self.subs.len()
            && self.state.is_live()
        {
            self.state.mark_eof();
            handler.on_eof();
        }
    }

    fn get_available(&self, _partial: bool) -> i64 {
        -1
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        let limit = match self.earliest_unsettled_start() {
            Some(start) => (start - self.cursor).min(self.buffered.len() as u64) as usize,
            None => self.buffered.len(),
        };
        if limit > 0 {
            list.push_buffer(self.buffered[..limit].to_vec().into());
        }
        list.set_more(!self.upstream_eof || self.earliest_unsettled_start().is_some() || limit < self.buffered.len());
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        let n = n.min(self.buffered.len());
        let _ = self.buffered.split_to(n);
        self.cursor += n as u64;
        ConsumeBucketResult {
            consumed: n,
            eof: self.upstream_eof && self.buffered.is_empty() && self.next_sub >= self.subs.len(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryIstream;
    use crate::test_util::CollectHandler;

    fn drain_replace<I: Istream>(s: &mut ReplaceIstream<I>) -> CollectHandler {
        let mut h = CollectHandler::default();
        let mut guard = 0;
        while !h.eof {
            s.read(&mut h);
            guard += 1;
            assert!(guard < 100, "ReplaceIstream never reached EOF");
        }
        h
    }

    #[test]
    fn test_replace_example_from_spec() {
        let mem = MemoryIstream::new(Bytes::from_static(b"abcdefghijklmnopqrstuvwxyz"));
        let mut s = ReplaceIstream::new(mem);
        let h1 = s.add(3, 3, Bytes::from_static(b"foo"));
        let h2 = s.add(6, 6, Bytes::from_static(b"bar"));
        s.finish(h1).unwrap();
        s.finish(h2).unwrap();

        let h = drain_replace(&mut s);
        assert_eq!(
            String::from_utf8(h.data).unwrap(),
            "abcfoodefbarghijklmnopqrstuvwxyz"
        );
    }

    #[test]
    fn test_replace_extend_after_add_moves_end() {
        let mem = MemoryIstream::new(Bytes::from_static(b"abcdef"));
        let mut s = ReplaceIstream::new(mem);
        let h = s.add(1, 2, Bytes::from_static(b"X"));
        s.extend(h, 3).unwrap();
        s.finish(h).unwrap();

        let h2 = drain_replace(&mut s);
        assert_eq!(String::from_utf8(h2.data).unwrap(), "aXdef");
    }

    #[test]
    fn test_replace_extend_after_finish_errors() {
        let mem = MemoryIstream::new(Bytes::from_static(b"abc"));
        let mut s = ReplaceIstream::new(mem);
        let h = s.add(0, 1, Bytes::from_static(b"X"));
        s.finish(h).unwrap();
        assert!(s.extend(h, 2).is_err());
    }

    #[test]
    fn test_replace_blocks_until_finish() {
        let mem = MemoryIstream::new(Bytes::from_static(b"abcdef"));
        let mut s = ReplaceIstream::new(mem);
        let h = s.add(2, 2, Bytes::from_static(b"X"));
        let mut handler = CollectHandler::default();
        s.read(&mut handler);
        assert_eq!(handler.data, b"ab");
        assert!(!handler.eof);
        s.finish(h).unwrap();
        let rest = drain_replace(&mut s);
        assert_eq!(String::from_utf8(rest.data).unwrap(), "Xcdef");
    }
}
