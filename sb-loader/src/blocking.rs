use std::time::Duration;

use async_trait::async_trait;
use sb_core::PipelineError;

use crate::resource_loader::{ResourceLoader, ResourceRequest, ResourceResponse};

/// Never responds unless cancelled — spec §4.3 "testing": used to exercise
/// callers' cancellation paths. Polls `cancel` rather than blocking
/// forever so a test can tear it down promptly.
pub struct BlockingResourceLoader {
    poll_interval: Duration,
}

impl BlockingResourceLoader {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
        }
    }
}

impl Default for BlockingResourceLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl ResourceLoader for BlockingResourceLoader {
    async fn send_request(&self, request: ResourceRequest) -> Result<ResourceResponse, PipelineError> {
        loop {
            if request.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use sb_core::ResourceAddress;

    #[tokio::test]
    async fn test_returns_cancelled_once_cancel_fires() {
        let request = ResourceRequest::new(Method::GET, ResourceAddress::None, 0);
        let cancel = request.cancel.clone();
        let loader = BlockingResourceLoader::new();

        let fut = loader.send_request(request);
        tokio::pin!(fut);

        let still_pending = tokio::time::timeout(Duration::from_millis(10), &mut fut).await;
        assert!(still_pending.is_err(), "should not resolve before cancel");

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_millis(200), fut).await.unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
