use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info};

use super::DetectionProvider;

/// Bounds the number of in-flight provider calls and times each one.
///
/// Callers beyond the capacity wait for a permit. The permit is dropped when
/// the call returns, whatever the outcome.
pub struct RequestCoordinator {
    provider: Arc<dyn DetectionProvider>,
    permits: Semaphore,
    capacity: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("image bytes cannot be empty")]
    InvalidInput,
    #[error("request limiter closed")]
    Closed,
}

impl RequestCoordinator {
    pub fn new(provider: Arc<dyn DetectionProvider>, max_concurrent_requests: usize) -> Self {
        let capacity = max_concurrent_requests.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            provider,
            permits: Semaphore::new(capacity),
            capacity,
        }
    }

    /// Describe `image_bytes` using the provider, waiting for a free slot
    /// first. Empty input is rejected without calling the provider.
    pub async fn detect(&self, image_bytes: &[u8]) -> Result<String, DetectError> {
        if image_bytes.is_empty() {
            return Err(DetectError::InvalidInput);
        }

        if self.available_permits() == 0 {
            debug!(capacity = self.capacity, "all request slots busy, waiting");
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DetectError::Closed)?;

        let started = Instant::now();
        info!(
            provider = self.provider.name(),
            bytes = image_bytes.len(),
            at = %Utc::now().format("%H:%M:%S"),
            "starting image analysis"
        );

        let description = self.provider.analyze(image_bytes).await;

        info!(
            provider = self.provider.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            at = %Utc::now().format("%H:%M:%S"),
            "analysis completed"
        );
        Ok(description)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{
        ProviderError, SceneDescriber, VisionBackend, VisionRequest, ERROR_FALLBACK,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Provider that sleeps and records how many calls overlap.
    #[derive(Default)]
    struct SlowProvider {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        events: Mutex<Vec<(&'static str, usize)>>,
    }

    #[async_trait]
    impl DetectionProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn analyze(&self, image_bytes: &[u8]) -> String {
            let id = image_bytes[0] as usize;
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.events.lock().unwrap().push(("start", id));

            tokio::time::sleep(Duration::from_millis(20)).await;

            self.events.lock().unwrap().push(("end", id));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            format!("description {id}")
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl VisionBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn model(&self) -> &str {
            "none"
        }

        async fn complete(&self, _: &VisionRequest) -> Result<Option<String>, ProviderError> {
            Err(ProviderError::Status {
                status: 503,
                body: "upstream unavailable".into(),
            })
        }
    }

    async fn run_concurrently(coordinator: Arc<RequestCoordinator>, n: u8) -> Vec<String> {
        let handles: Vec<_> = (0..n)
            .map(|i| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.detect(&[i]).await.unwrap() })
            })
            .collect();
        let mut out = Vec::new();
        for handle in handles {
            out.push(handle.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn empty_input_rejected_without_provider_call() {
        let provider = Arc::new(SlowProvider::default());
        let coordinator = RequestCoordinator::new(provider.clone(), 1);
        let err = coordinator.detect(&[]).await.unwrap_err();
        assert!(matches!(err, DetectError::InvalidInput));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn default_capacity_serializes_calls() {
        let provider = Arc::new(SlowProvider::default());
        let coordinator = Arc::new(RequestCoordinator::new(provider.clone(), 1));

        let results = run_concurrently(coordinator.clone(), 4).await;

        assert_eq!(results.len(), 4);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.available_permits(), 1);

        // Every start is immediately followed by its own end.
        let events = provider.events.lock().unwrap();
        for pair in events.chunks(2) {
            assert_eq!(pair[0].0, "start");
            assert_eq!(pair[1], ("end", pair[0].1));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn capacity_bounds_overlap() {
        let provider = Arc::new(SlowProvider::default());
        let coordinator = Arc::new(RequestCoordinator::new(provider.clone(), 2));

        run_concurrently(coordinator.clone(), 6).await;

        assert_eq!(coordinator.capacity(), 2);
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(coordinator.available_permits(), 2);
    }

    #[tokio::test]
    async fn zero_capacity_is_raised_to_one() {
        let coordinator = RequestCoordinator::new(Arc::new(SlowProvider::default()), 0);
        assert_eq!(coordinator.capacity(), 1);
        assert_eq!(coordinator.detect(&[7]).await.unwrap(), "description 7");
    }

    #[test]
    fn oversized_capacity_is_clamped() {
        let coordinator = RequestCoordinator::new(Arc::new(SlowProvider::default()), usize::MAX);
        assert_eq!(coordinator.capacity(), Semaphore::MAX_PERMITS);
    }

    #[tokio::test]
    async fn provider_failure_returns_fallback_and_releases_permit() {
        let provider = Arc::new(SceneDescriber::new(Box::new(FailingBackend)));
        let coordinator = RequestCoordinator::new(provider, 1);

        assert_eq!(coordinator.detect(&[1, 2, 3]).await.unwrap(), ERROR_FALLBACK);
        assert_eq!(coordinator.available_permits(), 1);
        assert_eq!(coordinator.detect(&[4]).await.unwrap(), ERROR_FALLBACK);
    }
}
