use parking_lot::Mutex;
use async_trait::async_trait;
use http::HeaderMap;
use sb_cache::{Cache, CacheEntry};
use sb_core::PipelineError;
use sb_istream::MemoryIstream;

use crate::resource_loader::{drain_to_vec, ResourceLoader, ResourceRequest, ResourceResponse};

struct CachedHttpResponse {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
}

/// Delegates to a *filter cache* keyed on `(address, body_etag, status,
/// source_id)` — spec §4.3 "used for POST-as-filter". `source_id` is this
/// crate's stand-in: `ResourceRequestParams::cache_tag`, the nearest field
/// the distilled data model exposes for "which upstream filter class
/// produced this".
pub struct FilterResourceLoader<L> {
    inner: L,
    cache: Mutex<Cache<CachedHttpResponse>>,
    ttl_secs: u64,
}

impl<L: ResourceLoader> FilterResourceLoader<L> {
    pub fn new(inner: L, max_size: usize, ttl_secs: u64) -> Self {
        Self {
            inner,
            cache: Mutex::new(Cache::new(max_size)),
            ttl_secs,
        }
    }

    fn cache_key(request: &ResourceRequest) -> String {
        format!(
            "{:?}|{}|{}|{}",
            request.address,
            request.body_etag.as_deref().unwrap_or(""),
            request.status.unwrap_or(0),
            request.params.cache_tag.as_deref().unwrap_or(""),
        )
    }
}

#[async_trait(?Send)]
impl<L: ResourceLoader> ResourceLoader for FilterResourceLoader<L> {
    async fn send_request(&self, request: ResourceRequest) -> Result<ResourceResponse, PipelineError> {
        let key = Self::cache_key(&request);
        let now = request.now;

        if let Some(cached) = {
            let mut cache = self.cache.lock();
            cache.get(&key, now).and_then(|h| {
                cache.value(h).map(|v| (v.status, v.headers.clone(), v.body.clone()))
            })
        } {
            let (status, headers, body) = cached;
            return Ok(ResourceResponse::new(status, headers, Some(Box::new(MemoryIstream::new(body)))));
        }

        let response = self.inner.send_request(request).await?;
        let status = response.status;
        let headers = response.headers.clone();
        let body = match response.body {
            Some(mut b) => drain_to_vec(b.as_mut())?,
            None => Vec::new(),
        };

        let size = body.len();
        let entry = CachedHttpResponse {
            status,
            headers: headers.clone(),
            body: body.clone(),
        };
        self.cache.lock().put(&key, CacheEntry::new(entry, size, now + self.ttl_secs), now);

        Ok(ResourceResponse::new(status, headers, Some(Box::new(MemoryIstream::new(body)))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use sb_core::ResourceAddress;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingLoader {
        calls: Rc<Cell<u32>>,
    }

    #[async_trait(?Send)]
    impl ResourceLoader for CountingLoader {
        async fn send_request(&self, _request: ResourceRequest) -> Result<ResourceResponse, PipelineError> {
            self.calls.set(self.calls.get() + 1);
            Ok(ResourceResponse::new(200, HeaderMap::new(), Some(Box::new(MemoryIstream::new(bytes::Bytes::from_static(b"body"))))))
        }
    }

    #[tokio::test]
    async fn test_second_identical_request_is_served_from_cache() {
        let calls = Rc::new(Cell::new(0));
        let loader = FilterResourceLoader::new(CountingLoader { calls: calls.clone() }, 1024, 60);

        let req1 = ResourceRequest::new(Method::POST, ResourceAddress::None, 0);
        loader.send_request(req1).await.unwrap();
        let req2 = ResourceRequest::new(Method::POST, ResourceAddress::None, 1);
        loader.send_request(req2).await.unwrap();

        assert_eq!(calls.get(), 1, "second request should hit the filter cache");
    }

    #[tokio::test]
    async fn test_different_body_etag_misses_cache() {
        let calls = Rc::new(Cell::new(0));
        let loader = FilterResourceLoader::new(CountingLoader { calls: calls.clone() }, 1024, 60);

        let mut req1 = ResourceRequest::new(Method::POST, ResourceAddress::None, 0);
        req1.body_etag = Some("a".into());
        loader.send_request(req1).await.unwrap();

        let mut req2 = ResourceRequest::new(Method::POST, ResourceAddress::None, 1);
        req2.body_etag = Some("b".into());
        loader.send_request(req2).await.unwrap();

        assert_eq!(calls.get(), 2);
    }
}
