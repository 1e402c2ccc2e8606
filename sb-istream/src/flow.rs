use crate::bucket::BucketList;
use crate::core::{ConsumeBucketResult, FdTypeMask, Istream, IstreamHandler, TerminationState};
use sb_core::PipelineError;
use std::time::{Duration, Instant};

/// Infinite source of zero bytes, per chunk size `chunk_len` — spec §4.1
/// supplement `ZeroIstream`.
pub struct ZeroIstream {
    chunk: Vec<u8>,
}

impl ZeroIstream {
    pub fn new(chunk_len: usize) -> Self {
        Self {
            chunk: vec![0u8; chunk_len.max(1)],
        }
    }
}

impl Istream for ZeroIstream {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        handler.on_data(&self.chunk);
    }

    fn get_available(&self, _partial: bool) -> i64 {
        -1
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        list.set_more(true);
    }

    fn consume_bucket_list(&mut self, _n: usize) -> ConsumeBucketResult {
        ConsumeBucketResult {
            consumed: 0,
            eof: false,
        }
    }

    fn close(&mut self) {}
}

/// Halts delivery until [`resume`](Self::resume) is called — spec §4.1
/// `PauseIstream`, used to break read-loop reentrancy.
pub struct PauseIstream<I> {
    upstream: I,
    paused: bool,
}

impl<I: Istream> PauseIstream<I> {
    pub fn new(upstream: I) -> Self {
        Self {
            upstream,
            paused: false,
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

impl<I: Istream> Istream for PauseIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if self.paused {
            return;
        }
        self.upstream.read(handler);
    }

    fn get_available(&self, partial: bool) -> i64 {
        self.upstream.get_available(partial)
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        if self.paused {
            list.set_more(true);
            return;
        }
        self.upstream.fill_bucket_list(list);
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        self.upstream.consume_bucket_list(n)
    }

    fn close(&mut self) {
        self.upstream.close();
    }

    fn direct_mask(&self) -> FdTypeMask {
        if self.paused {
            FdTypeMask::empty()
        } else {
            self.upstream.direct_mask()
        }
    }
}

/// Admits at most a caller-authorised budget of bytes downstream per
/// window — spec §4.1 `ApproveIstream`. `approve(n)` authorises `n` more
/// bytes; once the budget is exhausted, further reads withhold data.
pub struct ApproveIstream<I> {
    upstream: I,
    approved: u64,
}

impl<I: Istream> ApproveIstream<I> {
    pub fn new(upstream: I) -> Self {
        Self {
            upstream,
            approved: 0,
        }
    }

    pub fn approve(&mut self, n: u64) {
        self.approved += n;
    }
}

struct ApproveAdapter<'a> {
    approved: &'a mut u64,
    inner: &'a mut dyn IstreamHandler,
}

impl<'a> IstreamHandler for ApproveAdapter<'a> {
    fn on_data(&mut self, data: &[u8]) -> usize {
        let allowed = (*self.approved).min(data.len() as u64) as usize;
        if allowed == 0 {
            return 0;
        }
        let consumed = self.inner.on_data(&data[..allowed]);
        *self.approved -= consumed as u64;
        consumed
    }

    fn on_eof(&mut self) {
        self.inner.on_eof();
    }

    fn on_error(&mut self, error: PipelineError) {
        self.inner.on_error(error);
    }
}

impl<I: Istream> Istream for ApproveIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if self.approved == 0 {
            return;
        }
        let mut adapter = ApproveAdapter {
            approved: &mut self.approved,
            inner: handler,
        };
        self.upstream.read(&mut adapter);
    }

    fn get_available(&self, partial: bool) -> i64 {
        self.upstream.get_available(partial)
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        if self.approved == 0 {
            list.set_more(true);
            return;
        }
        self.upstream.fill_bucket_list(list);
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        let n = (n as u64).min(self.approved) as usize;
        let result = self.upstream.consume_bucket_list(n);
        self.approved -= result.consumed as u64;
        result
    }

    fn close(&mut self) {
        self.upstream.close();
    }

    fn direct_mask(&self) -> FdTypeMask {
        FdTypeMask::empty()
    }
}

/// Wraps an upstream that may be discarded and swapped for a null stream
/// before any bytes are read — spec §4.1 `OptionalIstream`, used to drop
/// an unused response body without holding its producer open.
pub struct OptionalIstream<I> {
    inner: OptionalInner<I>,
}

enum OptionalInner<I> {
    Upstream(I),
    Discarded(crate::source::NullIstream),
}

impl<I: Istream> OptionalIstream<I> {
    pub fn new(upstream: I) -> Self {
        Self {
            inner: OptionalInner::Upstream(upstream),
        }
    }

    /// Discards the upstream (closing it) and substitutes an immediate-EOF
    /// stream in its place.
    pub fn discard(&mut self) {
        if let OptionalInner::Upstream(mut up) = std::mem::replace(
            &mut self.inner,
            OptionalInner::Discarded(crate::source::NullIstream::new()),
        ) {
            up.close();
        }
    }

    pub fn is_discarded(&self) -> bool {
        matches!(self.inner, OptionalInner::Discarded(_))
    }
}

impl<I: Istream> Istream for OptionalIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        match &mut self.inner {
            OptionalInner::Upstream(up) => up.read(handler),
            OptionalInner::Discarded(n) => n.read(handler),
        }
    }

    fn get_available(&self, partial: bool) -> i64 {
        match &self.inner {
            OptionalInner::Upstream(up) => up.get_available(partial),
            OptionalInner::Discarded(n) => n.get_available(partial),
        }
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        match &mut self.inner {
            OptionalInner::Upstream(up) => up.fill_bucket_list(list),
            OptionalInner::Discarded(n) => n.fill_bucket_list(list),
        }
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        match &mut self.inner {
            OptionalInner::Upstream(up) => up.consume_bucket_list(n),
            OptionalInner::Discarded(d) => d.consume_bucket_list(n),
        }
    }

    fn close(&mut self) {
        match &mut self.inner {
            OptionalInner::Upstream(up) => up.close(),
            OptionalInner::Discarded(n) => n.close(),
        }
    }
}

/// Defers the first `read()` by one call — spec §4.1 `LaterIstream`/
/// `DeferReadIstream`, used to break out of the caller's stack frame
/// before upstream starts delivering. Without an event loop wired into
/// this crate, "later" is modeled as "not this call, the next one";
/// callers that need true scheduling wrap this with their reactor's defer
/// primitive.
pub struct LaterIstream<I> {
    upstream: I,
    armed: bool,
}

impl<I: Istream> LaterIstream<I> {
    pub fn new(upstream: I) -> Self {
        Self {
            upstream,
            armed: false,
        }
    }
}

impl<I: Istream> Istream for LaterIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.armed {
            self.armed = true;
            return;
        }
        self.upstream.read(handler);
    }

    fn get_available(&self, partial: bool) -> i64 {
        self.upstream.get_available(partial)
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        if !self.armed {
            list.set_more(true);
            return;
        }
        self.upstream.fill_bucket_list(list);
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        self.upstream.consume_bucket_list(n)
    }

    fn close(&mut self) {
        self.upstream.close();
    }

    fn direct_mask(&self) -> FdTypeMask {
        self.upstream.direct_mask()
    }
}

/// Holds forever and never delivers anything on its own; a test calls
/// [`inject_error`](Self::inject_error) to fire `on_error` at an arbitrary
/// point — spec §4.1 `InjectIstream`.
pub struct InjectIstream {
    error: Option<PipelineError>,
    state: TerminationState,
}

impl InjectIstream {
    pub fn new() -> Self {
        Self {
            error: None,
            state: TerminationState::default(),
        }
    }

    pub fn inject_error(&mut self, error: PipelineError) {
        self.error = Some(error);
    }
}

impl Default for InjectIstream {
    fn default() -> Self {
        Self::new()
    }
}

impl Istream for InjectIstream {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.state.is_live() {
            return;
        }
        if let Some(e) = self.error.take() {
            self.state.mark_error();
            handler.on_error(e);
        }
    }

    fn get_available(&self, _partial: bool) -> i64 {
        -1
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        list.set_more(true);
    }

    fn consume_bucket_list(&mut self, _n: usize) -> ConsumeBucketResult {
        ConsumeBucketResult {
            consumed: 0,
            eof: false,
        }
    }

    fn close(&mut self) {
        self.state.mark_closed();
    }
}

/// Caps how many bytes are forwarded to the handler per `on_data`
/// invocation, to exercise handlers against partial-consume paths — spec
/// §4.1 `FourIstream`/`ByteIstream` (`cap = 4` / `cap = 1` respectively).
pub struct ByteCapIstream<I> {
    upstream: I,
    cap: usize,
}

impl<I: Istream> ByteCapIstream<I> {
    pub fn new(upstream: I, cap: usize) -> Self {
        Self {
            upstream,
            cap: cap.max(1),
        }
    }

    pub fn four(upstream: I) -> Self {
        Self::new(upstream, 4)
    }

    pub fn one(upstream: I) -> Self {
        Self::new(upstream, 1)
    }
}

struct CapAdapter<'a> {
    cap: usize,
    inner: &'a mut dyn IstreamHandler,
}

impl<'a> IstreamHandler for CapAdapter<'a> {
    fn on_data(&mut self, data: &[u8]) -> usize {
        let take = self.cap.min(data.len());
        self.inner.on_data(&data[..take])
    }

    fn on_eof(&mut self) {
        self.inner.on_eof();
    }

    fn on_error(&mut self, error: PipelineError) {
        self.inner.on_error(error);
    }
}

impl<I: Istream> Istream for ByteCapIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        let mut adapter = CapAdapter {
            cap: self.cap,
            inner: handler,
        };
        self.upstream.read(&mut adapter);
    }

    fn get_available(&self, partial: bool) -> i64 {
        self.upstream.get_available(partial)
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        self.upstream.fill_bucket_list(list);
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        self.upstream.consume_bucket_list(n.min(self.cap))
    }

    fn close(&mut self) {
        self.upstream.close();
    }
}

/// Fails with a timeout error if no data/EOF/error arrives from upstream
/// within `duration` of the first `read()` — spec §4.1 `TimeoutIstream`.
/// The timer is checked cooperatively on each `read()` call (this crate
/// has no timer-wheel of its own; the server's event loop drives `read()`
/// regularly enough for this to fire promptly in practice).
pub struct TimeoutIstream<I> {
    upstream: I,
    duration: Duration,
    started_at: Option<Instant>,
    state: TerminationState,
}

impl<I: Istream> TimeoutIstream<I> {
    pub fn new(upstream: I, duration: Duration) -> Self {
        Self {
            upstream,
            duration,
            started_at: None,
            state: TerminationState::default(),
        }
    }
}

struct ProgressAdapter<'a> {
    progressed: &'a mut bool,
    inner: &'a mut dyn IstreamHandler,
}

impl<'a> IstreamHandler for ProgressAdapter<'a> {
    fn on_data(&mut self, data: &[u8]) -> usize {
        *self.progressed = true;
        self.inner.on_data(data)
    }

    fn on_eof(&mut self) {
        *self.progressed = true;
        self.inner.on_eof();
    }

    fn on_error(&mut self, error: PipelineError) {
        *self.progressed = true;
        self.inner.on_error(error);
    }
}

impl<I: Istream> Istream for TimeoutIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.state.is_live() {
            return;
        }
        let started = *self.started_at.get_or_insert_with(Instant::now);
        if started.elapsed() >= self.duration {
            self.state.mark_error();
            handler.on_error(PipelineError::Timeout(
                "no data within configured duration".into(),
            ));
            return;
        }
        let mut progressed = false;
        {
            let mut adapter = ProgressAdapter {
                progressed: &mut progressed,
                inner: handler,
            };
            self.upstream.read(&mut adapter);
        }
        if progressed {
            self.started_at = Some(Instant::now());
        }
    }

    fn get_available(&self, partial: bool) -> i64 {
        self.upstream.get_available(partial)
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        self.upstream.fill_bucket_list(list);
    }

    fn consume_bucket_list(&mut self, n: usize) -> ConsumeBucketResult {
        self.upstream.consume_bucket_list(n)
    }

    fn close(&mut self) {
        self.upstream.close();
        self.state.mark_closed();
    }

    fn direct_mask(&self) -> FdTypeMask {
        self.upstream.direct_mask()
    }
}
