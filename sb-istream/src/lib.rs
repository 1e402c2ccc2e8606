pub mod bucket;
pub mod compose;
pub mod core;
pub mod dechunk;
pub mod deflate;
pub mod flow;
pub mod length;
pub mod replace;
pub mod source;

pub use bucket::{Bucket, BucketFlags, BucketList};
pub use compose::{CatchIstream, ConcatIstream, NotifyIstream, NotifyOutcome};
pub use core::{ConsumeBucketResult, DirectResult, FdTypeMask, Istream, IstreamHandler, TerminationState};
pub use dechunk::{DechunkHandler, DechunkIstream};
pub use deflate::{DeflateIstream, InflateIstream};
pub use flow::{
    ApproveIstream, ByteCapIstream, InjectIstream, LaterIstream, OptionalIstream, PauseIstream,
    TimeoutIstream, ZeroIstream,
};
pub use length::LengthIstream;
pub use replace::{ReplaceIstream, SubstitutionHandle};
pub use source::{DelayedIstream, HeadIstream, MemoryIstream, NullIstream};

#[cfg(test)]
pub(crate) mod test_util {
    use crate::core::{Istream, IstreamHandler};
    use sb_core::PipelineError;

    /// Test-only handler that accumulates everything it's handed, optionally
    /// capping how much it accepts per call to exercise partial-consume.
    #[derive(Default)]
    pub struct CollectHandler {
        pub data: Vec<u8>,
        pub eof: bool,
        pub error: Option<String>,
        pub max_take: Option<usize>,
    }

    impl IstreamHandler for CollectHandler {
        fn on_data(&mut self, data: &[u8]) -> usize {
            let take = self.max_take.unwrap_or(data.len()).min(data.len());
            self.data.extend_from_slice(&data[..take]);
            take
        }

        fn on_eof(&mut self) {
            self.eof = true;
        }

        fn on_error(&mut self, error: PipelineError) {
            self.error = Some(error.to_string());
        }
    }

    /// Drains an istream to completion against a fresh `CollectHandler`,
    /// re-`read`ing until EOF/error, for tests that don't care about
    /// partial-consume stepping.
    #[allow(dead_code)]
    pub fn drain(mut s: impl Istream) -> CollectHandler {
        let mut h = CollectHandler::default();
        let mut guard = 0;
        while !h.eof && h.error.is_none() {
            s.read(&mut h);
            guard += 1;
            assert!(guard < 10_000, "istream never reached a terminal state");
        }
        h
    }
}
