use async_trait::async_trait;
use sb_core::PipelineError;
use sb_istream::MemoryIstream;

use crate::resource_loader::{drain_to_vec, LoaderBody, ResourceLoader, ResourceRequest, ResourceResponse};

/// Echoes the request's headers and body back as the response — spec
/// §4.3, a testing fixture for exercising callers of the loader chain
/// without a real backend.
pub struct MirrorResourceLoader;

#[async_trait(?Send)]
impl ResourceLoader for MirrorResourceLoader {
    async fn send_request(&self, mut request: ResourceRequest) -> Result<ResourceResponse, PipelineError> {
        if request.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let body: Option<LoaderBody> = match request.body.take() {
            Some(mut b) => {
                let data = drain_to_vec(b.as_mut())?;
                Some(Box::new(MemoryIstream::new(data)))
            }
            None => None,
        };
        Ok(ResourceResponse::new(request.status.unwrap_or(200), request.headers, body))
    }
}
