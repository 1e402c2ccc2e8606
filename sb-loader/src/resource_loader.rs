use async_trait::async_trait;
use http::{HeaderMap, Method};
use sb_core::{CancelHandle, PipelineError, ResourceAddress, ResourceRequestParams};
use sb_istream::Istream;

/// A request body or response body handed through the loader chain.
/// Ownership transfers with the `Box` (spec §4.3 "body (if present) is an
/// istream; ownership transfers to the loader/handler").
pub type LoaderBody = Box<dyn Istream>;

/// One call through the loader chain — spec §4.3's `SendRequest(pool,
/// stopwatch, params, method, address, status, headers, body?, body_etag?,
/// handler, cancel)`. `pool`/`stopwatch` aren't modeled (no arena, no
/// per-request profiling in this crate); `now` stands in for the
/// stopwatch's role of giving the call a fixed notion of "current time" for
/// cache/blacklist lookups, matching the explicit-`now` convention used by
/// `sb-session` and `sb-cache`.
pub struct ResourceRequest {
    pub now: u64,
    pub params: ResourceRequestParams,
    pub method: Method,
    pub address: ResourceAddress,
    pub status: Option<u16>,
    pub headers: HeaderMap,
    pub body: Option<LoaderBody>,
    pub body_etag: Option<String>,
    pub cancel: CancelHandle,
}

impl ResourceRequest {
    pub fn new(method: Method, address: ResourceAddress, now: u64) -> Self {
        Self {
            now,
            params: ResourceRequestParams::default(),
            method,
            address,
            status: None,
            headers: HeaderMap::new(),
            body: None,
            body_etag: None,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_body(mut self, body: LoaderBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// A delivered response — spec §4.3 `OnHttpResponse(status, headers, body?)`.
pub struct ResourceResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Option<LoaderBody>,
}

impl ResourceResponse {
    pub fn new(status: u16, headers: HeaderMap, body: Option<LoaderBody>) -> Self {
        Self { status, headers, body }
    }
}

/// Named per spec §4.3 for fidelity with the original callback contract.
/// `ResourceLoader::send_request` below is the idiomatic Rust shape (an
/// async `Result`); [`deliver`] bridges the two, calling exactly one of
/// these methods unless `cancel` fired first — matching "unless
/// `cancel.Cancel()` has been called first, in which case no invocation
/// occurs."
pub trait HttpResponseHandler {
    fn on_http_response(&mut self, response: ResourceResponse);
    fn on_http_error(&mut self, error: PipelineError);
}

/// Sends a request for a `ResourceAddress` and returns a response — spec
/// §4.3. `?Send`: this pipeline is demand-driven and single-task per
/// request (mirroring the istream framework's single-threaded model), so
/// the returned future need not be `Send`.
#[async_trait(?Send)]
pub trait ResourceLoader {
    async fn send_request(&self, request: ResourceRequest) -> Result<ResourceResponse, PipelineError>;
}

/// Drives a [`ResourceLoader`] and dispatches its outcome to a
/// [`HttpResponseHandler`], honoring cancellation: if `cancel` had already
/// fired, neither handler method is called (spec §4.3).
pub async fn deliver(
    loader: &dyn ResourceLoader,
    request: ResourceRequest,
    handler: &mut dyn HttpResponseHandler,
) {
    let cancel = request.cancel.clone();
    match loader.send_request(request).await {
        Ok(response) => {
            if !cancel.is_cancelled() {
                handler.on_http_response(response);
            }
        }
        Err(PipelineError::Cancelled) => {}
        Err(e) => {
            if !cancel.is_cancelled() {
                handler.on_http_error(e);
            }
        }
    }
}

/// Drains an istream believed to be immediately satisfiable (everything
/// this crate constructs is in-memory) into a single buffer. Bounds the
/// iteration count rather than looping forever if a future `Istream`
/// impl ever blocks here.
pub fn drain_to_vec(stream: &mut dyn Istream) -> Result<Vec<u8>, PipelineError> {
    struct Collector {
        data: Vec<u8>,
        eof: bool,
        error: Option<PipelineError>,
    }
    impl sb_istream::IstreamHandler for Collector {
        fn on_data(&mut self, data: &[u8]) -> usize {
            self.data.extend_from_slice(data);
            data.len()
        }
        fn on_eof(&mut self) {
            self.eof = true;
        }
        fn on_error(&mut self, error: PipelineError) {
            self.error = Some(error);
        }
    }

    let mut collector = Collector {
        data: Vec::new(),
        eof: false,
        error: None,
    };
    let mut guard = 0;
    while !collector.eof && collector.error.is_none() {
        stream.read(&mut collector);
        guard += 1;
        if guard > 10_000 {
            return Err(PipelineError::Internal("body istream never reached a terminal state".into()));
        }
    }
    match collector.error {
        Some(e) => Err(e),
        None => Ok(collector.data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_istream::MemoryIstream;

    #[test]
    fn test_drain_to_vec_collects_full_body() {
        let mut s = MemoryIstream::new(bytes::Bytes::from_static(b"hello world"));
        let data = drain_to_vec(&mut s).unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn test_deliver_skips_handler_when_already_cancelled() {
        struct Loader;
        #[async_trait::async_trait(?Send)]
        impl ResourceLoader for Loader {
            async fn send_request(&self, _req: ResourceRequest) -> Result<ResourceResponse, PipelineError> {
                Ok(ResourceResponse::new(200, HeaderMap::new(), None))
            }
        }
        #[derive(Default)]
        struct Handler {
            responses: u32,
            errors: u32,
        }
        impl HttpResponseHandler for Handler {
            fn on_http_response(&mut self, _r: ResourceResponse) {
                self.responses += 1;
            }
            fn on_http_error(&mut self, _e: PipelineError) {
                self.errors += 1;
            }
        }

        let req = ResourceRequest::new(Method::GET, ResourceAddress::None, 0);
        req.cancel.cancel();
        let mut handler = Handler::default();
        deliver(&Loader, req, &mut handler).await;
        assert_eq!(handler.responses, 0);
        assert_eq!(handler.errors, 0);
    }
}
