//! Integration tests for the cairn-vault crate.
//!
//! These tests run the Ed25519 pregeneration pool under watchdog supervision
//! alongside a consumer service, and check the pool's bounds and fallback
//! behaviour with real key material.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cairn_kernel::{BoxError, CancellationToken, Lifetime, Service, watch_dog};
use cairn_vault::{Ed25519Source, KeyGenerator, KeyPairSource, KeyPoolConfig};

/// Draws `target` pairs from the pool, verifying each, then terminates.
struct Consumer {
    pool: Arc<KeyGenerator>,
    target: usize,
    taken: AtomicUsize,
}

#[async_trait]
impl Service for Consumer {
    fn name(&self) -> &str {
        "consumer"
    }

    async fn on_run(&self, token: CancellationToken) -> Result<(), BoxError> {
        let verifier = Ed25519Source::new();
        while self.taken.load(Ordering::SeqCst) < self.target && !token.is_cancelled() {
            let pair = self.pool.acquire().await?;
            verifier.verify(&pair)?;
            self.taken.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Ok(())
    }
}

fn small_pool() -> Arc<KeyGenerator> {
    Arc::new(KeyGenerator::new(KeyPoolConfig {
        max_pregenerated: 4,
        max_concurrent: 2,
        idle_interval: Duration::from_millis(5),
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_drains_while_pool_refills() {
    let pool = small_pool();
    let consumer = Arc::new(Consumer {
        pool: Arc::clone(&pool),
        target: 20,
        taken: AtomicUsize::new(0),
    });
    let children = vec![Lifetime::new(pool.clone()), Lifetime::new(consumer.clone())];

    tokio::time::timeout(
        Duration::from_secs(10),
        watch_dog(&children, &CancellationToken::new()),
    )
    .await
    .expect("supervision should finish")
    .unwrap();

    assert_eq!(consumer.taken.load(Ordering::SeqCst), 20);
    let stats = pool.stats();
    assert!(stats.pooled <= 4);
    assert!(stats.peak_in_flight <= 2);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.served + stats.fallbacks, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn warm_pool_serves_without_fallback() {
    let pool = small_pool();
    let lifetime = Lifetime::new(pool.clone());
    let token = CancellationToken::new();
    lifetime.start(&token).await.unwrap();
    let runner = {
        let lifetime = Arc::clone(&lifetime);
        tokio::spawn(async move { lifetime.run().await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while pool.stats().pooled < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pool should fill");

    for _ in 0..4 {
        let pair = pool.get_new().unwrap();
        pool.source().verify(&pair).unwrap();
    }
    assert_eq!(pool.stats().fallbacks, 0);

    token.cancel();
    runner.await.unwrap().unwrap();
    lifetime.stop().await.unwrap();
}

#[test]
fn cold_pool_never_blocks_forever() {
    let pool = small_pool();
    let pairs: Vec<_> = (0..3).map(|_| pool.get_new().unwrap()).collect();

    for pair in &pairs {
        pool.source().verify(pair).unwrap();
    }
    assert_eq!(pool.stats().fallbacks, 3);
    assert_eq!(pool.stats().pooled, 0);
}
