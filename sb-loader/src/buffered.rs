use async_trait::async_trait;
use sb_core::PipelineError;
use sb_istream::MemoryIstream;

use crate::resource_loader::{drain_to_vec, ResourceLoader, ResourceRequest, ResourceResponse};

/// Stages a request body before forwarding it (spec §4.3): spools the
/// whole body into memory first so an inner loader's backend-selection
/// and connect can run against a request that's already fully arrived,
/// rather than racing a still-streaming upload. Skipped entirely when
/// there's no body.
pub struct BufferedResourceLoader<L> {
    inner: L,
}

impl<L: ResourceLoader> BufferedResourceLoader<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }
}

#[async_trait(?Send)]
impl<L: ResourceLoader> ResourceLoader for BufferedResourceLoader<L> {
    async fn send_request(&self, mut request: ResourceRequest) -> Result<ResourceResponse, PipelineError> {
        if let Some(mut body) = request.body.take() {
            let data = drain_to_vec(body.as_mut())?;
            request.body = Some(Box::new(MemoryIstream::new(data)));
        }
        self.inner.send_request(request).await
    }
}
