use thiserror::Error;

/// Unified error taxonomy for the pipeline (spec §7).
///
/// `Cancelled` is special: it must never be surfaced to a client. Callers
/// that reach the top-level request handler are expected to translate every
/// other variant into a status code via [`PipelineError::status_code`].
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Socket/file read or write failure. `ECONNRESET`/`EPIPE` are demoted
    /// to a level-4 ("debug") log by callers, not escalated here.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed HTTP/CGI/chunked data, premature EOF, header overflow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Any configured timeout fired (spec §5).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Resolver failure, connection refused, backend unreachable.
    #[error("resource error: {0}")]
    Resource(String),

    /// Arena, dpool, or shm allocation failed.
    #[error("out of memory: {0}")]
    Oom(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// Propagated silently; never reported to the client.
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Map to the HTTP status surfaced to the client (spec §7). Callers must
    /// never call this for `Cancelled` — there is no client-visible status.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::Io(_) => 502,
            PipelineError::Protocol(_) => 400,
            PipelineError::Timeout(_) => 504,
            PipelineError::Resource(_) => 502,
            PipelineError::Oom(_) => 503,
            PipelineError::NotFound(_) => 404,
            PipelineError::Forbidden(_) => 403,
            PipelineError::BadGateway(_) => 502,
            PipelineError::Internal(_) => 500,
            PipelineError::Cancelled => 499,
        }
    }

    /// Plain-text body for the client. The server never forwards backend
    /// stack traces — only the taxonomy-level message.
    pub fn to_plain_body(&self) -> Vec<u8> {
        format!("{}\n", self).into_bytes()
    }

    /// `true` for the retryable kinds named in spec §4.3 (backend
    /// unreachable / connection refused); retry is handled internally by
    /// the resource loader, never exposed to the client as a distinct
    /// error kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Resource(_) | PipelineError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(PipelineError::NotFound("x".into()).status_code(), 404);
        assert_eq!(PipelineError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(PipelineError::BadGateway("x".into()).status_code(), 502);
        assert_eq!(PipelineError::Resource("x".into()).status_code(), 502);
        assert_eq!(PipelineError::Timeout("x".into()).status_code(), 504);
        assert_eq!(PipelineError::Oom("x".into()).status_code(), 503);
        assert_eq!(PipelineError::Internal("x".into()).status_code(), 500);
        assert_eq!(PipelineError::Protocol("x".into()).status_code(), 400);
    }

    #[test]
    fn test_plain_body_never_echoes_stack_traces() {
        let err = PipelineError::Internal("boom at connection.rs:42".into());
        let body = String::from_utf8(err.to_plain_body()).unwrap();
        assert!(body.contains("boom at connection.rs:42"));
        // the taxonomy message is the only thing forwarded — no separate
        // stack-trace field exists to leak.
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(PipelineError::Resource("refused".into()).is_retryable());
        assert!(!PipelineError::Protocol("bad chunk".into()).is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
    }

    #[test]
    fn test_io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: PipelineError = io_err.into();
        assert_eq!(err.status_code(), 502);
    }
}
