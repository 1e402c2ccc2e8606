use crate::bucket::BucketList;
use crate::core::{ConsumeBucketResult, FdTypeMask, Istream, IstreamHandler, TerminationState};
use flate2::write::{GzEncoder, GzDecoder};
use flate2::Compression;
use sb_core::PipelineError;
use std::io::Write;

/// Compresses the upstream byte stream with gzip (spec §4.1 supplement
/// `DeflateIstream`). Named for the original's filter but implemented over
/// `flate2`'s gzip encoder, matching what the rest of the corpus reaches
/// for when it needs DEFLATE/gzip framing.
pub struct DeflateIstream<I> {
    upstream: I,
    encoder: GzEncoder<Vec<u8>>,
    pending: Vec<u8>,
    pending_pos: usize,
    upstream_eof: bool,
    finished: bool,
    state: TerminationState,
}

impl<I: Istream> DeflateIstream<I> {
    pub fn new(upstream: I) -> Self {
        Self {
            upstream,
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
            pending: Vec::new(),
            pending_pos: 0,
            upstream_eof: false,
            finished: false,
            state: TerminationState::default(),
        }
    }
}

impl<I: Istream> Istream for DeflateIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.state.is_live() {
            return;
        }

        if self.pending_pos < self.pending.len() {
            let consumed = handler.on_data(&self.pending[self.pending_pos..]);
            self.pending_pos += consumed;
            if self.pending_pos < self.pending.len() {
                return;
            }
        }

        if !self.upstream_eof {
            struct Feed<'a> {
                encoder: &'a mut GzEncoder<Vec<u8>>,
                eof: &'a mut bool,
                error: &'a mut Option<PipelineError>,
            }
            impl<'a> IstreamHandler for Feed<'a> {
                fn on_data(&mut self, data: &[u8]) -> usize {
                    match self.encoder.write_all(data) {
                        Ok(()) => data.len(),
                        Err(e) => {
                            *self.error = Some(PipelineError::Io(e));
                            0
                        }
                    }
                }
                fn on_eof(&mut self) {
                    *self.eof = true;
                }
                fn on_error(&mut self, error: PipelineError) {
                    *self.error = Some(error);
                }
            }
            let mut error = None;
            {
                let mut feed = Feed {
                    encoder: &mut self.encoder,
                    eof: &mut self.upstream_eof,
                    error: &mut error,
                };
                self.upstream.read(&mut feed);
            }
            if let Some(e) = error {
                self.state.mark_error();
                handler.on_error(e);
                return;
            }
        }

        if self.upstream_eof && !self.finished {
            let encoder = std::mem::replace(&mut self.encoder, GzEncoder::new(Vec::new(), Compression::default()));
            match encoder.finish() {
                Ok(bytes) => {
                    self.pending = bytes;
                    self.pending_pos = 0;
                    self.finished = true;
                }
                Err(e) => {
                    self.state.mark_error();
                    handler.on_error(PipelineError::Io(e));
                    return;
                }
            }
            if self.pending_pos < self.pending.len() {
                let consumed = handler.on_data(&self.pending[self.pending_pos..]);
                self.pending_pos += consumed;
                if self.pending_pos < self.pending.len() {
                    return;
                }
            }
        }

        if self.finished && self.pending_pos >= self.pending.len() && self.state.is_live() {
            self.state.mark_eof();
            handler.on_eof();
        }
    }

    fn get_available(&self, _partial: bool) -> i64 {
        -1
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        list.set_more(!self.finished || self.pending_pos < self.pending.len());
    }

    fn consume_bucket_list(&mut self, _n: usize) -> ConsumeBucketResult {
        ConsumeBucketResult {
            consumed: 0,
            eof: self.finished && self.pending_pos >= self.pending.len(),
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

/// Decompresses a gzip byte stream (spec §4.1 supplement, the Deflate
/// filter's dual).
pub struct InflateIstream<I> {
    upstream: I,
    decoder: GzDecoder<Vec<u8>>,
    pending: Vec<u8>,
    pending_pos: usize,
    upstream_eof: bool,
    finished: bool,
    state: TerminationState,
}

impl<I: Istream> InflateIstream<I> {
    pub fn new(upstream: I) -> Self {
        Self {
            upstream,
            decoder: GzDecoder::new(Vec::new()),
            pending: Vec::new(),
            pending_pos: 0,
            upstream_eof: false,
            finished: false,
            state: TerminationState::default(),
        }
    }

    fn drain_decoder(&mut self) {
        let out = self.decoder.get_mut();
        if !out.is_empty() {
            self.pending.extend_from_slice(out);
            out.clear();
        }
    }
}

impl<I: Istream> Istream for InflateIstream<I> {
    fn read(&mut self, handler: &mut dyn IstreamHandler) {
        if !self.state.is_live() {
            return;
        }
        if self.pending_pos < self.pending.len() {
            let consumed = handler.on_data(&self.pending[self.pending_pos..]);
            self.pending_pos += consumed;
            if self.pending_pos < self.pending.len() {
                return;
            }
        }

        if !self.upstream_eof {
            struct Feed<'a> {
                decoder: &'a mut GzDecoder<Vec<u8>>,
                eof: &'a mut bool,
                error: &'a mut Option<PipelineError>,
            }
            impl<'a> IstreamHandler for Feed<'a> {
                fn on_data(&mut self, data: &[u8]) -> usize {
                    match self.decoder.write_all(data) {
                        Ok(()) => data.len(),
                        Err(e) => {
                            *self.error = Some(PipelineError::Protocol(format!("gzip decode: {e}")));
                            0
                        }
                    }
                }
                fn on_eof(&mut self) {
                    *self.eof = true;
                }
                fn on_error(&mut self, error: PipelineError) {
                    *self.error = Some(error);
                }
            }
            let mut error = None;
            {
                let mut feed = Feed {
                    decoder: &mut self.decoder,
                    eof: &mut self.upstream_eof,
                    error: &mut error,
                };
                self.upstream.read(&mut feed);
            }
            self.drain_decoder();
            if let Some(e) = error {
                self.state.mark_error();
                handler.on_error(e);
                return;
            }
        }

        if self.upstream_eof && !self.finished {
            if let Err(e) = self.decoder.try_finish() {
                self.state.mark_error();
                handler.on_error(PipelineError::Protocol(format!("gzip decode: {e}")));
                return;
            }
            self.drain_decoder();
            self.finished = true;
        }

        if self.pending_pos < self.pending.len() {
            let consumed = handler.on_data(&self.pending[self.pending_pos..]);
            self.pending_pos += consumed;
            if self.pending_pos < self.pending.len() {
                return;
            }
        }

        if self.finished && self.pending_pos >= self.pending.len() && self.state.is_live() {
            self.state.mark_eof();
            handler.on_eof();
        }
    }

    fn get_available(&self, _partial: bool) -> i64 {
        -1
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) {
        list.set_more(!self.finished || self.pending_pos < self.pending.len());
    }

    fn consume_bucket_list(&mut self, _n: usize) -> ConsumeBucketResult {
        ConsumeBucketResult {
            consumed: 0,
            eof: self.finished && self.pending_pos >= self.pending.len(),
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
