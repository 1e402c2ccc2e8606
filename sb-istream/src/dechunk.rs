use crate::bucket::BucketList;
use crate::core::{ConsumeBucketResult, FdTypeMask, Istream, IstreamHandler, TerminationState};
use sb_core::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ChunkHeader,
    ChunkData(u64),
    ChunkDataEnd,
    TrailerLine,
    Done,
}

/// Decodes HTTP/1.1 chunked transfer coding (spec §4.1 `DechunkIstream`).
/// `verbatim` mode passes the wire bytes (chunk sizes, CRLFs) through
/// unchanged to the handler instead of stripping them — used when this
/// filter only needs to detect the end of the chunked body without
/// re-encoding it (e.g. relaying chunked bodies byte-for-byte).
pub struct DechunkIstream<I> {
    upstream: I,
    phase: Phase,
    verbatim: bool,
    state: TerminationState,
    dechunk_end_fired: bool,
}

impl<I: Istream> DechunkIstream<I> {
    pub fn new(upstream: I) -> Self {
        Self {
            upstream,
            phase: Phase::ChunkHeader,
            verbatim: false,
            state: TerminationState::default(),
            dechunk_end_fired: false,
        }
    }

    pub fn verbatim(upstream: I) -> Self {
        Self {
            upstream,
            phase: Phase::ChunkHeader,
            verbatim: true,
            state: TerminationState::default(),
            dechunk_end_fired: false,
        }
    }

    /// Fires once, after the terminating `0\r\n\r\n` is consumed but before
    /// `on_eof` — spec §4.1 sequencing requirement `OnDechunkEnd`.
    fn fire_dechunk_end(&mut self, handler: &mut dyn DechunkHandler) {
        if !self.dechunk_end_fired {
            self.dechunk_end_fired = true;
            handler.on_dechunk_end();
        }
    }
}

/// Extension the dechunk filter's handler must implement, beyond plain
/// [`IstreamHandler`], to observe the chunked-body-end boundary.
pub trait DechunkHandler: IstreamHandler {
    fn on_dechunk_end(&mut self);
}

impl<I: Istream> Istream for DechunkIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        // Dechunk requires the dechunk-aware handler; callers must go
        // through `read_dechunk`. Plain `read` treats trailers/headers as
        // regular data once decoded, omitting the end-of-body callback.
        struct NoOpEnd<'a>(&'a mut dyn IstreamHandler);
        impl<'a> IstreamHandler for NoOpEnd<'a> {
            fn on_data(&mut self, data: &[u8]) -> usize {
                self.0.on_data(data)
            }
            fn on_eof(&mut self) {
                self.0.on_eof()
            }
            fn on_error(&mut self, error: PipelineError) {
                self.0.on_error(error)
            }
        }
        impl<'a> DechunkHandler for NoOpEnd<'a> {
            fn on_dechunk_end(&mut self) {}
        }
        let mut adapter = NoOpEnd(handler);
        self.read_dechunk(&mut adapter);
    }

    fn get_available(&self, _partial: bool) -> i64 {
        -1
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        list.set_more(!matches!(self.phase, Phase::Done));
    }

    fn consume_bucket_list(&mut self, _n: usize) -> ConsumeBucketResult {
        ConsumeBucketResult {
            consumed: 0,
            eof: matches!(self.phase, Phase::Done),
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

impl<I: Istream> DechunkIstream<I> {
    pub fn read_dechunk(&mut self, handler: &mut dyn DechunkHandler) {
        if !self.state.is_live() {
            return;
        }

        struct Parser<'a> {
            phase: &'a mut Phase,
            verbatim: bool,
            inner: &'a mut dyn DechunkHandler,
            end_fired: &'a mut bool,
            error: Option<PipelineError>,
        }

        impl<'a> IstreamHandler for Parser<'a> {
            fn on_data(&mut self, data: &[u8]) -> usize {
                let mut pos = 0usize;
                while pos < data.len() && self.error.is_none() {
                    match *self.phase {
                        Phase::ChunkHeader => {
                            if let Some(eol) = find_crlf(&data[pos..]) {
                                let line = &data[pos..pos + eol];
                                let size_str = std::str::from_utf8(line)
                                    .ok()
                                    .map(|s| s.split(';').next().unwrap_or("").trim());
                                let size = size_str.and_then(|s| u64::from_str_radix(s, 16).ok());
                                match size {
                                    Some(0) => {
                                        *self.phase = Phase::TrailerLine;
                                    }
                                    Some(n) => {
                                        *self.phase = Phase::ChunkData(n);
                                    }
                                    None => {
                                        self.error = Some(PipelineError::Protocol(
                                            "malformed chunk size".into(),
                                        ));
                                        break;
                                    }
                                }
                                let consumed_hdr = eol + 2;
                                if self.verbatim {
                                    let take = self.inner.on_data(&data[pos..pos + consumed_hdr]);
                                    if take < consumed_hdr {
                                        return pos;
                                    }
                                }
                                pos += consumed_hdr;
                            } else {
                                break;
                            }
                        }
                        Phase::ChunkData(remaining) => {
                            let avail = (data.len() - pos) as u64;
                            let take = remaining.min(avail) as usize;
                            if take > 0 {
                                let consumed = self.inner.on_data(&data[pos..pos + take]);
                                pos += consumed;
                                *self.phase = Phase::ChunkData(remaining - consumed as u64);
                                if consumed < take {
                                    return pos;
                                }
                            }
                            if let Phase::ChunkData(0) = *self.phase {
                                *self.phase = Phase::ChunkDataEnd;
                            } else {
                                break;
                            }
                        }
                        Phase::ChunkDataEnd => {
                            if data.len() - pos >= 2 {
                                if self.verbatim {
                                    let take = self.inner.on_data(&data[pos..pos + 2]);
                                    if take < 2 {
                                        return pos;
                                    }
                                }
                                pos += 2;
                                *self.phase = Phase::ChunkHeader;
                            } else {
                                break;
                            }
                        }
                        Phase::TrailerLine => {
                            if let Some(eol) = find_crlf(&data[pos..]) {
                                let consumed_hdr = eol + 2;
                                if self.verbatim {
                                    let take = self.inner.on_data(&data[pos..pos + consumed_hdr]);
                                    if take < consumed_hdr {
                                        return pos;
                                    }
                                }
                                pos += consumed_hdr;
                                if eol == 0 {
                                    *self.phase = Phase::Done;
                                    self.inner.on_dechunk_end();
                                    *self.end_fired = true;
                                }
                            } else {
                                break;
                            }
                        }
                        Phase::Done => break,
                    }
                }
                pos
            }

            fn on_eof(&mut self) {
                if !matches!(*self.phase, Phase::Done) {
                    self.error = Some(PipelineError::Protocol(
                        "upstream closed mid-chunked-body".into(),
                    ));
                }
            }

            fn on_error(&mut self, error: PipelineError) {
                self.error = Some(error);
            }
        }

        let error = {
            let mut parser = Parser {
                phase: &mut self.phase,
                verbatim: self.verbatim,
                inner: handler,
                end_fired: &mut self.dechunk_end_fired,
                error: None,
            };
            self.upstream.read(&mut parser);
            parser.error.take()
        };

        if let Some(e) = error {
            self.state.mark_error();
            handler.on_error(e);
            return;
        }

        if matches!(self.phase, Phase::Done) {
            self.fire_dechunk_end(handler);
            if self.state.is_live() {
                self.state.mark_eof();
                handler.on_eof();
            }
        }
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryIstream;
    use bytes::Bytes;

    #[derive(Default)]
    struct Collect {
        data: Vec<u8>,
        eof: bool,
        dechunk_end: bool,
    }

    impl IstreamHandler for Collect {
        fn on_data(&mut self, data: &[u8]) -> usize {
            self.data.extend_from_slice(data);
            data.len()
        }
        fn on_eof(&mut self) {
            self.eof = true;
        }
        fn on_error(&mut self, _error: PipelineError) {
            panic!("unexpected error");
        }
    }

    impl DechunkHandler for Collect {
        fn on_dechunk_end(&mut self) {
            self.dechunk_end = true;
        }
    }

    #[test]
    fn test_dechunk_decodes_body() {
        let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mem = MemoryIstream::new(Bytes::copy_from_slice(raw));
        let mut s = DechunkIstream::new(mem);
        let mut h = Collect::default();
        s.read_dechunk(&mut h);
        assert_eq!(h.data, b"Wikipedia");
        assert!(h.dechunk_end);
        assert!(h.eof);
    }

    #[test]
    fn test_dechunk_verbatim_preserves_wire_bytes() {
        let raw = b"4\r\nWiki\r\n0\r\n\r\n";
        let mem = MemoryIstream::new(Bytes::copy_from_slice(raw));
        let mut s = DechunkIstream::verbatim(mem);
        let mut h = Collect::default();
        s.read_dechunk(&mut h);
        assert_eq!(h.data, raw);
    }
}
