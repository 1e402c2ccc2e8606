use bitflags::bitflags;
use sb_core::PipelineError;
use std::os::unix::io::RawFd;

bitflags! {
    /// Bitmask of fd types a handler can accept via direct (splice) transfer.
    /// A filter either forwards this mask unchanged (passthrough) or clears
    /// it (it must see the bytes) — spec §4.1 "Direct transfer".
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdTypeMask: u8 {
        const PIPE    = 0b0001;
        const TCP     = 0b0010;
        const FILE    = 0b0100;
        const CHAR    = 0b1000;
    }
}

/// Outcome of handing a file descriptor off for zero-copy transfer
/// (spec §4.1 `OnDirect`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectResult {
    /// Moved some bytes via splice; stream stays open.
    Ok(usize),
    /// Upstream is at EOF.
    End,
    /// Downstream closed us.
    Closed,
    /// Would block; try again once writable/readable.
    Blocking,
    /// `errno`-style I/O error.
    Errno(i32),
}

/// Downstream consumer of an [`Istream`]. Exactly one handler exists per
/// istream for its lifetime (spec §3 data model).
pub trait IstreamHandler {
    /// Consume zero or more of `data`'s bytes, returning how many were
    /// taken. Returning less than `data.len()` means the handler is
    /// blocked; upstream must retain the remainder and re-deliver it (with
    /// any newly available bytes appended) on the next `read()`.
    fn on_data(&mut self, data: &[u8]) -> usize;

    /// Zero-copy fd hand-off. Default: refuse (handler doesn't support
    /// direct transfer for this source).
    fn on_direct(
        &mut self,
        _fd: RawFd,
        _offset: Option<u64>,
        _max_length: usize,
        _then_eof: bool,
    ) -> DirectResult {
        DirectResult::Errno(libc_enosys())
    }

    /// Fires exactly once, terminating the stream's lifetime, unless
    /// `on_error` fired instead or the stream was explicitly closed.
    fn on_eof(&mut self);

    /// Fires exactly once, terminating the stream's lifetime, unless
    /// `on_eof` fired instead or the stream was explicitly closed.
    fn on_error(&mut self, error: PipelineError);
}

fn libc_enosys() -> i32 {
    95 // ENOSYS; avoids a libc dependency in this crate for one constant.
}

/// A demand-driven, zero-copy byte stream (spec §4.1).
///
/// Every call to `read` may synchronously invoke the handler's `on_data`,
/// `on_direct`, `on_eof`, or `on_error` zero or more times before
/// returning. `read` may also destroy the stream (e.g. on error). It is a
/// logic error to call any method on an `Istream` after it has delivered
/// `on_eof`/`on_error` to its handler or after `close()` — debug builds
/// assert this; release builds treat it as a no-op.
pub trait Istream {
    /// Request more data. The handler is the one registered at
    /// construction time, passed again here to avoid a self-referential
    /// handler slot inside filter chains (see sb-istream crate docs).
    fn read(&mut self, handler: &mut dyn IstreamHandler);

    /// Known remaining length, or -1 if unknown. With `partial = true` a
    /// lower bound may be returned instead of requiring an exact count.
    fn get_available(&self, partial: bool) -> i64;

    /// Discard up to `n` bytes without delivering them. Returns the number
    /// actually skipped, or -1 if unsupported.
    fn skip(&mut self, _n: u64) -> i64 {
        -1
    }

    /// Append zero-copy buffer references to `list` without consuming
    /// anything from upstream.
    fn fill_bucket_list(&mut self, list: &mut super::bucket::BucketList);

    /// Advance past the first `n` bytes previously reported by
    /// `fill_bucket_list`; equivalent to `on_data` accepting those bytes.
    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult;

    /// If backed by a plain fd and the caller can take it, surrender it
    /// (destroying this istream). Default: unsupported.
    fn as_fd(&mut self) -> Option<RawFd> {
        None
    }

    /// Destroy without delivering EOF or error.
    fn close(&mut self);

    /// Fd types this source can deliver directly, if any.
    fn direct_mask(&self) -> FdTypeMask {
        FdTypeMask::empty()
    }
}

/// Result of [`Istream::consume_bucket_list`]: how many of the requested
/// bytes were actually committed, and whether the stream is now at EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeBucketResult {
    pub consumed: usize,
    pub eof: bool,
}

/// Tracks the one-shot termination rule from spec §3/§8: exactly one of
/// `{on_eof, on_error}` fires across a stream's lifetime, unless `close()`
/// pre-empts both. Filters embed this to assert correct usage in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationState {
    #[default]
    Live,
    Eof,
    Error,
    Closed,
}

impl TerminationState {
    pub fn is_live(&self) -> bool {
        matches!(self, TerminationState::Live)
    }

    pub fn mark_eof(&mut self) {
        debug_assert!(self.is_live(), "on_eof delivered twice or after terminal state");
        *self = TerminationState::Eof;
    }

    pub fn mark_error(&mut self) {
        debug_assert!(self.is_live(), "on_error delivered twice or after terminal state");
        *self = TerminationState::Error;
    }

    pub fn mark_closed(&mut self) {
        *self = TerminationState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_mask_passthrough_and_clear() {
        let mask = FdTypeMask::PIPE | FdTypeMask::TCP;
        assert!(mask.contains(FdTypeMask::PIPE));
        assert!(!mask.contains(FdTypeMask::FILE));
        let cleared = FdTypeMask::empty();
        assert!(cleared.is_empty());
    }

    #[test]
    fn test_termination_state_transitions() {
        let mut s = TerminationState::default();
        assert!(s.is_live());
        s.mark_eof();
        assert!(!s.is_live());
    }

    #[test]
    #[should_panic]
    fn test_double_eof_panics_in_debug() {
        let mut s = TerminationState::default();
        s.mark_eof();
        s.mark_eof();
    }
}
