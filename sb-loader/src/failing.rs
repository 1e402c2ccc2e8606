use async_trait::async_trait;
use sb_core::PipelineError;

use crate::resource_loader::{ResourceLoader, ResourceRequest, ResourceResponse};

/// Always errors — spec §4.3 "testing, placeholder": exercises callers'
/// error paths without needing a real backend that's actually down.
pub struct FailingResourceLoader;

#[async_trait(?Send)]
impl ResourceLoader for FailingResourceLoader {
    async fn send_request(&self, request: ResourceRequest) -> Result<ResourceResponse, PipelineError> {
        if request.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Err(PipelineError::Internal("FailingResourceLoader always fails".into()))
    }
}
