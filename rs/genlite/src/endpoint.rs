//! The endpoint pool: a concurrent resource allocator for a fixed set of
//! video generation workers, with LRU-over-healthy selection, round-robin
//! fallback, and exponential error backoff.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// A remote GPU worker URL, one of N in the pool.
///
/// Mutated only while the pool's mutex is held. At most one leaseholder may
/// observe `busy = true` for a given endpoint at any moment.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: u32,
    pub url: String,
    busy: bool,
    last_used_at: Instant,
    error_count: u32,
    error_until: Instant,
}

impl Endpoint {
    fn free(&self, now: Instant) -> bool {
        !self.busy && now > self.error_until
    }
}

/// Read-only snapshot of an endpoint's state, for the status endpoint.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub id: u32,
    pub url: String,
    pub busy: bool,
    pub error_count: u32,
    pub seconds_until_free: f64,
}

struct Inner {
    endpoints: Vec<Endpoint>,
    last_selected_index: usize,
}

/// Owns `[Endpoint]` exclusively; hands one out at a time under `lease`.
#[derive(Clone)]
pub struct EndpointPool {
    inner: Arc<Mutex<Inner>>,
}

impl EndpointPool {
    pub fn new(urls: Vec<String>) -> Self {
        let now = Instant::now();
        let endpoints = urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| Endpoint {
                id: i as u32 + 1,
                url,
                busy: false,
                last_used_at: now,
                error_count: 0,
                error_until: now,
            })
            .collect();

        EndpointPool {
            inner: Arc::new(Mutex::new(Inner {
                endpoints,
                last_selected_index: 0,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scoped acquisition of an endpoint. Release is guaranteed on every
    /// exit path (including early drop on cancellation) via `Lease::Drop`.
    pub async fn lease(&self, max_wait: Duration) -> Result<Lease> {
        let start = Instant::now();

        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(id) = select_endpoint(&mut inner) {
                    let now = Instant::now();
                    let endpoint = inner.endpoints.iter_mut().find(|e| e.id == id).unwrap();
                    endpoint.busy = true;
                    endpoint.last_used_at = now;
                    return Ok(Lease {
                        pool: self.clone(),
                        id,
                        url: endpoint.url.clone(),
                    });
                }
            }

            if start.elapsed() > max_wait {
                return Err(Error::Internal);
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Snapshot every endpoint's status for `/api/status`.
    pub fn status(&self) -> Vec<EndpointStatus> {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner
            .endpoints
            .iter()
            .map(|e| EndpointStatus {
                id: e.id,
                url: e.url.clone(),
                busy: e.busy,
                error_count: e.error_count,
                seconds_until_free: e.error_until.saturating_duration_since(now).as_secs_f64(),
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.endpoints.iter().filter(|e| e.free(now)).count()
    }

    fn release(&self, id: u32) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if let Some(endpoint) = inner.endpoints.iter_mut().find(|e| e.id == id) {
            endpoint.busy = false;
            endpoint.last_used_at = now;
        }
    }

    /// Mark an endpoint as errored with exponential backoff, doubled on timeout.
    pub fn report_failure(&self, id: u32, is_timeout: bool) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if let Some(endpoint) = inner.endpoints.iter_mut().find(|e| e.id == id) {
            endpoint.error_count += 1;
            let mut backoff = 15f64 * 2f64.powi(endpoint.error_count as i32 - 1);
            backoff = backoff.min(300.0);
            if is_timeout {
                backoff *= 2.0;
            }
            endpoint.error_until = now + Duration::from_secs_f64(backoff);
            tracing::warn!(id, error_count = endpoint.error_count, backoff, "endpoint marked in error state");
        }
    }

    /// Reset an endpoint's error state after a successful generation.
    pub fn report_success(&self, id: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(endpoint) = inner.endpoints.iter_mut().find(|e| e.id == id) {
            endpoint.error_count = 0;
            endpoint.error_until = Instant::now();
        }
    }
}

/// Selection algorithm, executed under the pool's mutex at each lease.
fn select_endpoint(inner: &mut Inner) -> Option<u32> {
    let now = Instant::now();

    if let Some(free) = inner
        .endpoints
        .iter()
        .filter(|e| e.free(now))
        .min_by(|a, b| a.last_used_at.cmp(&b.last_used_at).then(a.id.cmp(&b.id)))
    {
        return Some(free.id);
    }

    if inner.endpoints.is_empty() {
        return None;
    }

    let len = inner.endpoints.len();
    for step in 1..=len {
        let idx = (inner.last_selected_index + step) % len;
        if now > inner.endpoints[idx].error_until {
            inner.last_selected_index = idx;
            return Some(inner.endpoints[idx].id);
        }
    }

    // Every endpoint is in error: return the one with the smallest error_until.
    let fallback = inner.endpoints.iter().min_by_key(|e| e.error_until).unwrap();
    Some(fallback.id)
}

/// An exclusive, time-bounded claim on an endpoint for a single generation call.
///
/// Releasing (clearing `busy`) happens on drop, so every exit path —
/// including early return, panic unwind, or task cancellation — clears it.
pub struct Lease {
    pool: EndpointPool,
    pub id: u32,
    pub url: String,
}

impl Lease {
    pub fn report_failure(&self, is_timeout: bool) {
        self.pool.report_failure(self.id, is_timeout);
    }

    pub fn report_success(&self) {
        self.pool.report_success(self.id);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> EndpointPool {
        EndpointPool::new((1..=n).map(|i| format!("http://worker-{i}")).collect())
    }

    #[tokio::test]
    async fn lease_picks_least_recently_used_free_endpoint() {
        let pool = pool(2);
        let lease1 = pool.lease(Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease1.id, 1);
        drop(lease1);

        // endpoint 1 was just touched, so endpoint 2 (never used) is LRU.
        let lease2 = pool.lease(Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease2.id, 2);
    }

    #[tokio::test]
    async fn at_most_one_leaseholder_per_endpoint() {
        let pool = pool(1);
        let lease1 = pool.lease(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.active_count(), 0);
        drop(lease1);
        assert_eq!(pool.active_count(), 1);
    }

    #[tokio::test]
    async fn error_backoff_prefers_healthy_endpoint() {
        let pool = pool(2);
        pool.report_failure(1, false);

        let lease = pool.lease(Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease.id, 2);
    }

    #[test]
    fn backoff_formula_matches_spec() {
        let pool = pool(1);
        pool.report_failure(1, false);
        let status = pool.status();
        // error_count goes from 0 -> 1, backoff = min(15*2^0, 300) = 15s.
        assert!(status[0].seconds_until_free > 14.0 && status[0].seconds_until_free <= 15.0);
    }

    #[test]
    fn timeout_doubles_backoff() {
        let pool = pool(1);
        pool.report_failure(1, true);
        let status = pool.status();
        assert!(status[0].seconds_until_free > 29.0 && status[0].seconds_until_free <= 30.0);
    }

    #[test]
    fn success_resets_error_state() {
        let pool = pool(1);
        pool.report_failure(1, false);
        pool.report_success(1);
        let status = pool.status();
        assert_eq!(status[0].error_count, 0);
        assert_eq!(status[0].seconds_until_free, 0.0);
    }

    #[tokio::test]
    async fn all_errored_pool_still_yields_an_endpoint() {
        let pool = pool(2);
        pool.report_failure(1, false);
        pool.report_failure(2, false);

        // Selection never blocks forever: step 4 always returns some endpoint.
        let lease = pool.lease(Duration::from_millis(50)).await.unwrap();
        assert!(lease.id == 1 || lease.id == 2);
    }
}
