use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use sb_core::PipelineError;
use tokio::sync::Notify;

/// Per-origin probe state — spec §4.4. `Http1`/`Http2` are terminal once
/// reached; a failed probe falls back to `Unknown` so the next request
/// tries again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Unknown,
    Pending,
    Http1,
    Http2,
}

struct Origin {
    state: Mutex<ProbeState>,
    notify: Notify,
}

/// Registry of per-origin ALPN probe state, keyed on `{name, bind-address,
/// remote-address, filter-params}` serialized by the caller into a single
/// string (spec §4.4). One [`AnyHttpClient`] is shared across all requests
/// a process makes.
///
/// The original models concurrent waiters as an intrusive list drained by
/// a deferred scheduler pass inside a single-threaded event loop. On a
/// multi-threaded async runtime the natural equivalent is a `Notify`: every
/// waiter for an origin blocks on the same `Notify`, and whichever task
/// transitions `Unknown -> Pending` is the one that actually probes.
pub struct AnyHttpClient {
    origins: Mutex<HashMap<String, Arc<Origin>>>,
}

impl AnyHttpClient {
    pub fn new() -> Self {
        Self {
            origins: Mutex::new(HashMap::new()),
        }
    }

    fn origin(&self, key: &str) -> Arc<Origin> {
        self.origins
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Origin {
                    state: Mutex::new(ProbeState::Unknown),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    pub fn state(&self, key: &str) -> ProbeState {
        *self.origin(key).state.lock()
    }

    /// Resolves which transport `key` should use, running `probe` at most
    /// once per `Unknown -> Pending` transition (spec §4.4 transitions):
    ///
    /// - First caller for an origin: state -> `Pending`, runs `probe`.
    /// - Concurrent callers while `Pending`: park on the origin's queue
    ///   until the state changes, then re-evaluate.
    /// - `probe` succeeding with h2: state -> `Http2`.
    /// - `probe` succeeding with h1 (ALPN mismatch): state -> `Http1`.
    /// - `probe` erroring: state -> `Unknown` (back to start, "the queue
    ///   is reprocessed" — the next waiter to wake becomes the new
    ///   prober), and the error is returned to every waiter that was
    ///   parked on this attempt.
    pub async fn resolve<F, Fut>(&self, key: &str, probe: F) -> Result<ProbeState, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProbeState, PipelineError>>,
    {
        let origin = self.origin(key);

        loop {
            let notified = {
                let mut state = origin.state.lock();
                match *state {
                    ProbeState::Http1 | ProbeState::Http2 => return Ok(*state),
                    ProbeState::Pending => Some(origin.notify.notified()),
                    ProbeState::Unknown => {
                        *state = ProbeState::Pending;
                        None
                    }
                }
            };

            let Some(notified) = notified else {
                break;
            };
            notified.await;
        }

        let result = probe().await;
        let mut state = origin.state.lock();
        *state = match &result {
            Ok(resolved) => *resolved,
            Err(_) => ProbeState::Unknown,
        };
        drop(state);
        origin.notify.notify_waiters();
        result
    }
}

impl Default for AnyHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_first_request_probes_and_caches_http2() {
        let client = AnyHttpClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let state = client
            .resolve("origin-a", || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(ProbeState::Http2)
            })
            .await
            .unwrap();
        assert_eq!(state, ProbeState::Http2);
        assert_eq!(client.state("origin-a"), ProbeState::Http2);

        // second call must not probe again
        let state2 = client
            .resolve("origin-a", || async { panic!("should not re-probe") })
            .await
            .unwrap();
        assert_eq!(state2, ProbeState::Http2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_alpn_mismatch_resolves_to_http1() {
        let client = AnyHttpClient::new();
        let state = client.resolve("origin-b", || async { Ok(ProbeState::Http1) }).await.unwrap();
        assert_eq!(state, ProbeState::Http1);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_see_the_single_probe_result() {
        let client = Arc::new(AnyHttpClient::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                client
                    .resolve("origin-c", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(ProbeState::Http2)
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), ProbeState::Http2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one waiter performs the probe");
    }

    #[tokio::test]
    async fn test_probe_error_resets_to_unknown_and_allows_retry() {
        let client = AnyHttpClient::new();
        let err = client
            .resolve("origin-d", || async { Err(PipelineError::Resource("refused".into())) })
            .await;
        assert!(err.is_err());
        assert_eq!(client.state("origin-d"), ProbeState::Unknown);

        let state = client.resolve("origin-d", || async { Ok(ProbeState::Http1) }).await.unwrap();
        assert_eq!(state, ProbeState::Http1);
    }
}
