use bytes::BytesMut;
use sb_core::PipelineError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Callbacks a [`FilteredSocket`] drives while pumping data — spec §4.2
/// "Filtered socket" responsibility. Mirrors the istream handler shape
/// (demand-driven, `on_data` returns bytes consumed) since both sit on
/// the same single-threaded, cooperative data-flow model.
pub trait SocketHandler {
    /// New input bytes arrived; returns how many were consumed. Returning
    /// less than `data.len()` means the handler is blocked — the
    /// remainder stays buffered for the next delivery.
    fn on_data(&mut self, data: &[u8]) -> usize;

    /// Peer closed for reading (EOF on input).
    fn on_end(&mut self);

    /// The output buffer has been fully flushed to the peer.
    fn on_write(&mut self);

    /// Fires once the socket becomes fully drained (input consumed to
    /// EOF and output flushed) — false→true transition only, per spec §3
    /// `FilteredSocket` invariants.
    fn on_drained(&mut self) {}

    /// The read or write deadline elapsed; return `true` to keep the
    /// socket alive (handler will re-arm its own deadline), `false` to
    /// let the socket close.
    fn on_timeout(&mut self) -> bool {
        false
    }

    fn on_error(&mut self, error: PipelineError);
}

/// Wraps an asyncronous transport `S` (plain TCP, or a filter-decorated
/// stream such as TLS) with a double buffer and exposes the demand-driven
/// `SocketHandler` contract on top of it — spec §4.2.
///
/// `S` stands in for the "pluggable filter chain": an `IdentityFilter`
/// leaves `S` as a bare `TcpStream`; `AlpnTlsFilter` produces a
/// `tokio_rustls::client::TlsStream<TcpStream>` instead. Both implement
/// `AsyncRead + AsyncWrite`, so `FilteredSocket` itself stays filter-agnostic.
pub struct FilteredSocket<S> {
    transport: S,
    input: BytesMut,
    output: BytesMut,
    read_buf: Vec<u8>,
    input_eof: bool,
    ended: bool,
    drained: bool,
    closed: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FilteredSocket<S> {
    pub fn new(transport: S) -> Self {
        Self {
            transport,
            input: BytesMut::new(),
            output: BytesMut::new(),
            read_buf: vec![0u8; 16 * 1024],
            input_eof: false,
            ended: false,
            drained: false,
            closed: false,
        }
    }

    pub fn input(&self) -> &[u8] {
        &self.input
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Queue bytes for the peer; actually written on the next
    /// [`flush`](Self::flush).
    pub fn write(&mut self, data: &[u8]) {
        debug_assert!(!self.closed, "write on a closed FilteredSocket");
        self.output.extend_from_slice(data);
    }

    /// Read once from the transport, append to the input buffer, and
    /// drive `handler.on_data` until it stops consuming. Delivers
    /// `on_end` once on EOF. Errors propagate via `on_error`, never as a
    /// `Result`, matching the istream convention (spec §4.1 "Error flow").
    pub async fn schedule_read(&mut self, handler: &mut dyn SocketHandler) {
        if self.closed {
            return;
        }
        if !self.input_eof {
            match self.transport.read(&mut self.read_buf).await {
                Ok(0) => {
                    tracing::debug!("socket read EOF");
                    self.input_eof = true;
                }
                Ok(n) => self.input.extend_from_slice(&self.read_buf[..n]),
                Err(e) => {
                    tracing::debug!(error = %e, "socket read error");
                    handler.on_error(PipelineError::Io(e));
                    return;
                }
            }
        }

        loop {
            if self.input.is_empty() {
                break;
            }
            let consumed = handler.on_data(&self.input);
            debug_assert!(consumed <= self.input.len());
            if consumed == 0 {
                break;
            }
            let _ = self.input.split_to(consumed);
        }

        if self.input_eof && self.input.is_empty() && !self.ended {
            self.ended = true;
            handler.on_end();
        }
        self.maybe_mark_drained(handler);
    }

    /// Write out as much of the output buffer as the transport accepts
    /// without blocking the caller's task indefinitely (a single
    /// `write` call); fires `on_write` once fully flushed.
    pub async fn flush(&mut self, handler: &mut dyn SocketHandler) {
        if self.closed || self.output.is_empty() {
            return;
        }
        match self.transport.write_all(&self.output).await {
            Ok(()) => {
                self.output.clear();
                handler.on_write();
                self.maybe_mark_drained(handler);
            }
            Err(e) => {
                tracing::debug!(error = %e, "socket write error");
                handler.on_error(PipelineError::Io(e));
            }
        }
    }

    fn maybe_mark_drained(&mut self, handler: &mut dyn SocketHandler) {
        if !self.drained && self.ended && self.output.is_empty() {
            self.drained = true;
            handler.on_drained();
        }
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.transport.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[derive(Default)]
    struct Collect {
        data: Vec<u8>,
        ended: bool,
        written: bool,
        drained: bool,
        error: Option<String>,
    }

    impl SocketHandler for Collect {
        fn on_data(&mut self, data: &[u8]) -> usize {
            self.data.extend_from_slice(data);
            data.len()
        }
        fn on_end(&mut self) {
            self.ended = true;
        }
        fn on_write(&mut self) {
            self.written = true;
        }
        fn on_drained(&mut self) {
            self.drained = true;
        }
        fn on_error(&mut self, error: PipelineError) {
            self.error = Some(error.to_string());
        }
    }

    #[tokio::test]
    async fn test_schedule_read_delivers_bytes_then_end() {
        let (mut a, b) = duplex(64);
        a.write_all(b"hello").await.unwrap();
        drop(a);
        let mut socket = FilteredSocket::new(b);
        let mut h = Collect::default();
        for _ in 0..2 {
            socket.schedule_read(&mut h).await;
        }
        assert_eq!(h.data, b"hello");
        assert!(h.ended);
    }

    #[tokio::test]
    async fn test_flush_writes_and_drains() {
        let (a, mut b) = duplex(64);
        let mut socket = FilteredSocket::new(a);
        socket.write(b"world");
        let mut h = Collect::default();
        socket.flush(&mut h).await;
        assert!(h.written);
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }
}
