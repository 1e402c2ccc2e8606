use crate::bucket::BucketList;
use crate::core::{ConsumeBucketResult, FdTypeMask, Istream, IstreamHandler, TerminationState};
use sb_core::PipelineError;

/// Enforces an exact content length on top of an upstream istream. Spec
/// §4.1 `LengthIstream`: delivering fewer bytes than declared before EOF is
/// a protocol error; delivering more than declared is also a protocol
/// error, raised as soon as the excess arrives.
pub struct LengthIstream<I> {
    upstream: I,
    remaining: u64,
    state: TerminationState,
}

impl<I: Istream> LengthIstream<I> {
    pub fn new(upstream: I, length: u64) -> Self {
        Self {
            upstream,
            remaining: length,
            state: TerminationState::default(),
        }
    }
}

enum Outcome {
    None,
    Eof,
    Error(PipelineError),
}

struct Adapter<'a> {
    remaining: &'a mut u64,
    inner: &'a mut dyn IstreamHandler,
    outcome: Outcome,
}

impl<'a> IstreamHandler for Adapter<'a> {
    fn on_data(&mut self, data: &[u8]) -> usize {
        if data.len() as u64 > *self.remaining {
            self.outcome = Outcome::Error(PipelineError::Protocol(format!(
                "upstream delivered {} bytes but only {} were declared",
                data.len(),
                *self.remaining
            )));
            return 0;
        }
        let consumed = self.inner.on_data(data);
        *self.remaining -= consumed as u64;
        consumed
    }

    fn on_eof(&mut self) {
        if *self.remaining > 0 {
            self.outcome = Outcome::Error(PipelineError::Protocol(format!(
                "upstream closed with {} bytes still owed",
                self.remaining
            )));
        } else {
            self.outcome = Outcome::Eof;
        }
    }

    fn on_error(&mut self, error: PipelineError) {
        self.outcome = Outcome::Error(error);
    }
}

impl<I: Istream> Istream for LengthIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.state.is_live() {
            return;
        }
        if self.remaining == 0 {
            self.state.mark_eof();
            handler.on_eof();
            return;
        }
        let mut adapter = Adapter {
            remaining: &mut self.remaining,
            inner: handler,
            outcome: Outcome::None,
        };
        self.upstream.read(&mut adapter);
        match adapter.outcome {
            Outcome::None => {}
            Outcome::Eof => {
                self.state.mark_eof();
                handler.on_eof();
            }
            Outcome::Error(e) => {
                self.state.mark_error();
                handler.on_error(e);
            }
        }
    }

    fn get_available(&self, _partial: bool) -> i64 {
        self.remaining as i64
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
        list.set_more(budget > 0);
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        let n = (n as u64).min(self.remaining) as usize;
        let result = self.upstream.consume_bucket_list(n);
        self.remaining -= result.consumed as u64;
        ConsumeBucketResult {
            consumed: result.consumed,
            eof: self.remaining == 0,
        }
    }

    fn close(&mut self) {
        self.upstream.close();
        self.state.mark_closed();
    }

    fn direct_mask(&self) -> FdTypeMask {
        self.upstream.direct_mask()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryIstream;
    use crate::test_util::CollectHandler;
    use bytes::Bytes;

    #[test]
    fn test_exact_length_succeeds() {
        let mem = MemoryIstream::new(Bytes::from_static(b"abcdef"));
        let mut s = LengthIstream::new(mem, 6);
        let mut h = CollectHandler::default();
        s.read(&mut h);
        assert_eq!(h.data, b"abcdef");
        assert!(h.eof);
        assert!(h.error.is_none());
    }

    #[test]
    fn test_under_length_is_protocol_error() {
        let mem = MemoryIstream::new(Bytes::from_static(b"abc"));
        let mut s = LengthIstream::new(mem, 6);
        let mut h = CollectHandler::default();
        s.read(&mut h);
        assert!(h.error.is_some());
        assert!(!h.eof);
    }

    #[test]
    fn test_over_length_errors() {
        let mem = MemoryIstream::new(Bytes::from_static(b"abcdefgh"));
        let mut s = LengthIstream::new(mem, 4);
        let mut h = CollectHandler::default();
        s.read(&mut h);
        assert!(h.error.is_some());
        assert!(!h.eof);
    }
}
