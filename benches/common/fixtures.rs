use futures::FutureExt;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use swr_query::{BoxError, QueryKey};

/// Test data structure for benchmarks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchUser {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub score: u32,
}

impl BenchUser {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            name: format!("User {}", id),
            email: format!("user{}@example.com", id),
            score: (id % 1000) as u32,
        }
    }
}

/// Simulated backend with configurable latency, addressed by `["user", {"id": n}]` keys.
#[derive(Clone)]
pub struct FakeBackend {
    data: Arc<HashMap<u64, BenchUser>>,
    latency_ms: u64,
    call_count: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new(num_users: usize, latency_ms: u64) -> Self {
        let data = (0..num_users as u64)
            .map(|id| (id, BenchUser::new(id)))
            .collect();

        Self {
            data: Arc::new(data),
            latency_ms,
            call_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn get(&self, key: QueryKey) -> Result<BenchUser, BoxError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);

        // Simulate network latency
        tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;

        let id = key
            .parts()
            .get(1)
            .and_then(|part| part.get("id"))
            .and_then(|id| id.as_u64())
            .ok_or("malformed user key")?;
        self.data
            .get(&id)
            .cloned()
            .ok_or_else(|| format!("user {} not found", id).into())
    }

    /// Fetch operation suitable for `build_query`.
    pub fn query_fn(
        &self,
    ) -> impl Fn(QueryKey) -> BoxFuture<'static, Result<BenchUser, BoxError>> + Send + Sync + 'static
    {
        let backend = self.clone();
        move |key| {
            let backend = backend.clone();
            async move { backend.get(key).await }.boxed()
        }
    }

    #[allow(dead_code)]
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

pub fn user_key(id: usize) -> QueryKey {
    QueryKey::from(json!(["user", {"id": id}]))
}

/// Generate test keys for different workload patterns
pub struct KeyGenerator {
    num_keys: usize,
}

impl KeyGenerator {
    pub fn new(num_keys: usize) -> Self {
        Self { num_keys }
    }

    /// Generate sequential keys (for cold cache tests)
    pub fn sequential(&self) -> Vec<QueryKey> {
        (0..self.num_keys).map(user_key).collect()
    }

    /// Generate keys with Zipf distribution (realistic - few hot keys)
    pub fn zipf_random(&self, count: usize) -> Vec<QueryKey> {
        let mut rng = rand::thread_rng();

        (0..count)
            .map(|_| {
                // Simplified Zipf: 80% of requests go to 20% of keys
                let id = if rng.gen_bool(0.8) {
                    rng.gen_range(0..(self.num_keys / 5))
                } else {
                    rng.gen_range((self.num_keys / 5)..self.num_keys)
                };
                user_key(id)
            })
            .collect()
    }

    /// Generate keys for mixed workload (some hits, some misses)
    pub fn mixed(&self, hit_ratio: f64) -> Vec<QueryKey> {
        let mut rng = rand::thread_rng();
        let hot_key_count = (self.num_keys as f64 * hit_ratio) as usize;

        (0..1000)
            .map(|_| {
                if rng.gen_bool(hit_ratio) {
                    user_key(rng.gen_range(0..hot_key_count))
                } else {
                    user_key(rng.gen_range(hot_key_count..self.num_keys))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    async fn test_fake_backend() {
        use super::{FakeBackend, user_key};

        let backend = FakeBackend::new(100, 1);

        let user = backend.get(user_key(0)).await.unwrap();
        assert_eq!(user.id, 0);
        assert!(backend.get(user_key(500)).await.is_err());

        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn test_key_generator() {
        use super::KeyGenerator;

        let key_gen = KeyGenerator::new(100);

        let seq = key_gen.sequential();
        assert_eq!(seq.len(), 100);
        assert_eq!(seq[0].hash(), "[\"user\",{\"id\":0}]");

        let zipf = key_gen.zipf_random(100);
        assert_eq!(zipf.len(), 100);

        let mixed = key_gen.mixed(0.8);
        assert_eq!(mixed.len(), 1000);
    }
}
