//! Memoising, rate-controlled embedding service.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::embeddings::{content_key, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::types::EmbeddingConfig;

/// Token bucket capping provider requests per minute.
///
/// On saturation, callers wait cooperatively for refill rather than fail.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rpm: u32) -> Self {
        let capacity = f64::from(rpm.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = Instant::now();
    }

    /// Take `n` tokens, returning how long the caller must wait first.
    fn acquire(&mut self, n: f64) -> Duration {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            Duration::ZERO
        } else {
            let deficit = n - self.tokens;
            self.tokens = 0.0;
            Duration::from_secs_f64(deficit / self.refill_per_sec)
        }
    }
}

/// Cached vector with bookkeeping for the stats surface.
struct MemoEntry {
    vector: Arc<Vec<f32>>,
    access_count: u64,
}

/// Counters for the stats surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingServiceStats {
    pub hits: u64,
    pub misses: u64,
    pub provider_calls: u64,
    pub cache_entries: usize,
}

impl EmbeddingServiceStats {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Deterministic text→vector mapping with per-content memoisation.
///
/// The memo key is a stable 64-bit hash of the exact input text plus the
/// model id; hits skip the external call entirely.
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    memo: Mutex<LruCache<u64, MemoEntry>>,
    bucket: Mutex<TokenBucket>,
    counters: Mutex<(u64, u64, u64)>,
    timeout: Duration,
}

impl EmbeddingService {
    #[must_use]
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        config: &EmbeddingConfig,
        timeout: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_entries.max(1)).unwrap();
        Self {
            provider,
            memo: Mutex::new(LruCache::new(capacity)),
            bucket: Mutex::new(TokenBucket::new(config.rpm)),
            counters: Mutex::new((0, 0, 0)),
            timeout,
        }
    }

    /// Embedding dimension of the wrapped provider.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    /// Model identifier of the wrapped provider.
    #[must_use]
    pub fn model_id(&self) -> String {
        self.provider.model_id().to_string()
    }

    /// Probe the memo cache without calling the provider.
    #[must_use]
    pub fn probe(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        let key = content_key(text, self.provider.model_id());
        let mut memo = self.memo.lock();
        memo.get_mut(&key).map(|entry| {
            entry.access_count += 1;
            Arc::clone(&entry.vector)
        })
    }

    /// Embed one text, serving repeats from the memo cache.
    pub async fn embed(&self, text: &str) -> Result<Arc<Vec<f32>>> {
        let key = content_key(text, self.provider.model_id());
        if let Some(entry) = self.lookup(key) {
            return Ok(entry);
        }

        self.throttle(1.0).await;
        let vector = self.call_provider(text).await?;
        let vector = Arc::new(vector);
        self.store(key, Arc::clone(&vector));
        Ok(vector)
    }

    /// Embed a batch; cached texts are not re-sent to the provider.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Arc<Vec<f32>>>> {
        let model = self.provider.model_id().to_string();
        let mut results: Vec<Option<Arc<Vec<f32>>>> = vec![None; texts.len()];
        let mut missing: Vec<(usize, String)> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = content_key(text, &model);
            match self.lookup(key) {
                Some(vector) => results[i] = Some(vector),
                None => missing.push((i, text.clone())),
            }
        }

        if !missing.is_empty() {
            self.throttle(missing.len() as f64).await;
            let batch: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
            self.bump_provider_calls();
            let vectors = tokio::time::timeout(self.timeout, self.provider.embed_batch(&batch))
                .await
                .map_err(|_| Error::ExecutionTimeout)?
                .map_err(|e| Error::EmbeddingUnavailable(e.to_string()))?;
            if vectors.len() != batch.len() {
                return Err(Error::EmbeddingUnavailable(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            for ((i, text), vector) in missing.into_iter().zip(vectors) {
                let key = content_key(&text, &model);
                let vector = Arc::new(vector);
                self.store(key, Arc::clone(&vector));
                results[i] = Some(vector);
            }
        }

        Ok(results.into_iter().map(|v| v.expect("all slots filled")).collect())
    }

    #[must_use]
    pub fn stats(&self) -> EmbeddingServiceStats {
        let (hits, misses, provider_calls) = *self.counters.lock();
        EmbeddingServiceStats {
            hits,
            misses,
            provider_calls,
            cache_entries: self.memo.lock().len(),
        }
    }

    fn lookup(&self, key: u64) -> Option<Arc<Vec<f32>>> {
        let mut memo = self.memo.lock();
        let mut counters = self.counters.lock();
        match memo.get_mut(&key) {
            Some(entry) => {
                counters.0 += 1;
                entry.access_count += 1;
                Some(Arc::clone(&entry.vector))
            }
            None => {
                counters.1 += 1;
                None
            }
        }
    }

    fn store(&self, key: u64, vector: Arc<Vec<f32>>) {
        self.memo.lock().put(
            key,
            MemoEntry {
                vector,
                access_count: 0,
            },
        );
    }

    async fn throttle(&self, tokens: f64) {
        let wait = self.bucket.lock().acquire(tokens);
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "embedding rate limit");
            tokio::time::sleep(wait).await;
        }
    }

    async fn call_provider(&self, text: &str) -> Result<Vec<f32>> {
        self.bump_provider_calls();
        tokio::time::timeout(self.timeout, self.provider.embed(text))
            .await
            .map_err(|_| Error::ExecutionTimeout)?
            .map_err(|e| Error::EmbeddingUnavailable(e.to_string()))
    }

    fn bump_provider_calls(&self) {
        self.counters.lock().2 += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingProvider {
        inner: HashEmbedder,
        calls: AtomicU64,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text).await
        }

        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn model_id(&self) -> &str {
            self.inner.model_id()
        }
    }

    fn service(provider: Arc<CountingProvider>) -> EmbeddingService {
        EmbeddingService::new(
            provider,
            &EmbeddingConfig::default(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn repeated_embeds_hit_the_memo() {
        let provider = Arc::new(CountingProvider {
            inner: HashEmbedder::new("m", 16),
            calls: AtomicU64::new(0),
        });
        let svc = service(provider.clone());

        let a = svc.embed("same text").await.unwrap();
        let b = svc.embed("same text").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(svc.stats().hits, 1);
    }

    #[tokio::test]
    async fn batch_skips_cached_texts() {
        let provider = Arc::new(CountingProvider {
            inner: HashEmbedder::new("m", 16),
            calls: AtomicU64::new(0),
        });
        let svc = service(provider.clone());

        svc.embed("alpha").await.unwrap();
        let batch = svc
            .embed_batch(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        // one single call + one batch call for the miss
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*batch[0], *svc.embed("alpha").await.unwrap());
    }

    #[tokio::test]
    async fn probe_does_not_call_provider() {
        let provider = Arc::new(CountingProvider {
            inner: HashEmbedder::new("m", 16),
            calls: AtomicU64::new(0),
        });
        let svc = service(provider.clone());

        assert!(svc.probe("unseen").is_none());
        svc.embed("unseen").await.unwrap();
        assert!(svc.probe("unseen").is_some());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn token_bucket_waits_when_empty() {
        let mut bucket = TokenBucket::new(60); // one per second
        assert_eq!(bucket.acquire(60.0), Duration::ZERO);
        let wait = bucket.acquire(1.0);
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(2));
    }
}
