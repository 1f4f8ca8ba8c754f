//! Key pair pregeneration pool.
//!
//! [`KeyGenerator`] is a [`Service`] that keeps a FIFO buffer of ready key
//! pairs topped up in the background, so callers needing a fresh pair rarely
//! pay the generation cost themselves.
//!
//! ```text
//!   on_run ──launch──▶ worker (blocking pool) ──push──▶ ┌──────────────┐
//!      ▲                    │ at most max_concurrent    │  ArrayQueue   │──pop──▶ get_new()
//!      └──── join_next ─────┘                           │ ≤ max_pregen  │
//!                                                       └──────────────┘
//! ```
//!
//! The pool is a latency optimisation only: [`KeyGenerator::get_new`] falls
//! back to inline generation when the buffer is empty, so every caller gets a
//! complete pair regardless of background timing.
//!
//! Bounds: a worker is launched only while `in_flight < max_concurrent` and
//! `pooled + in_flight < max_pregenerated`.  Launches happen on the single
//! run loop and a worker pushes before it leaves the in-flight count, so
//! neither bound can be overshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cairn_kernel::{BoxError, Service};
use crossbeam::queue::ArrayQueue;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto::{Ed25519Source, KeyPair, KeyPairSource};
use crate::error::{Result, VaultError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Sizing of the pregeneration pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPoolConfig {
    /// Upper bound on buffered pairs.
    pub max_pregenerated: usize,
    /// Upper bound on concurrently running generation workers.
    pub max_concurrent: usize,
    /// Back-off when nothing can be launched and nothing is in flight.
    pub idle_interval: Duration,
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            max_pregenerated: 32,
            max_concurrent: 4,
            idle_interval: Duration::from_millis(250),
        }
    }
}

impl KeyPoolConfig {
    /// Clamp both bounds to at least one.
    fn normalized(self) -> Self {
        Self {
            max_pregenerated: self.max_pregenerated.max(1),
            max_concurrent: self.max_concurrent.max(1),
            idle_interval: self.idle_interval,
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyPoolStats {
    /// Pairs currently buffered.
    pub pooled: usize,
    /// Workers currently generating.
    pub in_flight: usize,
    /// Highest `in_flight` ever observed.
    pub peak_in_flight: usize,
    /// Pairs produced by background workers.
    pub generated: u64,
    /// Pairs handed out from the buffer.
    pub served: u64,
    /// Requests that found the buffer empty and generated inline.
    pub fallbacks: u64,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct PoolState {
    config: KeyPoolConfig,
    source: Arc<dyn KeyPairSource>,
    buffer: ArrayQueue<KeyPair>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    generated: AtomicU64,
    served: AtomicU64,
    fallbacks: AtomicU64,
}

impl PoolState {
    fn can_launch(&self) -> bool {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        in_flight < self.config.max_concurrent
            && self.buffer.len() + in_flight < self.config.max_pregenerated
    }

    /// Body of one background worker.  Runs on the blocking pool.
    fn fill_one(&self) -> Result<()> {
        let outcome = self.source.generate().map(|pair| {
            if self.buffer.push(pair).is_err() {
                // Unreachable while the launch bound holds.
                debug!("key pool full, discarding generated pair");
            } else {
                self.generated.fetch_add(1, Ordering::Relaxed);
            }
        });
        let in_flight = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(
            pooled = self.buffer.len(),
            capacity = self.config.max_pregenerated,
            in_flight,
            "key pool occupancy"
        );
        outcome
    }

    fn pop(&self) -> Option<KeyPair> {
        let pair = self.buffer.pop()?;
        self.served.fetch_add(1, Ordering::Relaxed);
        Some(pair)
    }

    fn note_fallback(&self) {
        let fallbacks = self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            algorithm = self.source.algorithm(),
            fallbacks, "key pool empty, generating inline"
        );
    }
}

// ---------------------------------------------------------------------------
// KeyGenerator
// ---------------------------------------------------------------------------

/// Background key pair pool.
///
/// Share it behind an `Arc`: the [`Lifetime`](cairn_kernel::Lifetime) drives
/// the refill loop while consumers call [`get_new`](Self::get_new) or
/// [`acquire`](Self::acquire).
pub struct KeyGenerator {
    state: Arc<PoolState>,
}

impl KeyGenerator {
    /// Pool of Ed25519 pairs.
    pub fn new(config: KeyPoolConfig) -> Self {
        Self::with_source(config, Arc::new(Ed25519Source::new()))
    }

    /// Pool backed by a custom key source.
    pub fn with_source(config: KeyPoolConfig, source: Arc<dyn KeyPairSource>) -> Self {
        let config = config.normalized();
        Self {
            state: Arc::new(PoolState {
                buffer: ArrayQueue::new(config.max_pregenerated),
                config,
                source,
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                generated: AtomicU64::new(0),
                served: AtomicU64::new(0),
                fallbacks: AtomicU64::new(0),
            }),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> KeyPoolConfig {
        self.state.config
    }

    /// The key source.
    pub fn source(&self) -> &Arc<dyn KeyPairSource> {
        &self.state.source
    }

    /// Take the oldest pregenerated pair, or generate one on the calling
    /// thread if the pool is empty.
    ///
    /// The inline path is slow (it blocks the caller for a full key
    /// generation) and is logged and counted in [`KeyPoolStats::fallbacks`].
    pub fn get_new(&self) -> Result<KeyPair> {
        if let Some(pair) = self.state.pop() {
            return Ok(pair);
        }
        self.state.note_fallback();
        self.state.source.generate()
    }

    /// Async variant of [`get_new`](Self::get_new): the inline fallback runs
    /// on the blocking pool instead of the calling task.
    pub async fn acquire(&self) -> Result<KeyPair> {
        if let Some(pair) = self.state.pop() {
            return Ok(pair);
        }
        self.state.note_fallback();
        let source = Arc::clone(&self.state.source);
        tokio::task::spawn_blocking(move || source.generate()).await?
    }

    /// Current counters.
    pub fn stats(&self) -> KeyPoolStats {
        KeyPoolStats {
            pooled: self.state.buffer.len(),
            in_flight: self.state.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.state.peak_in_flight.load(Ordering::SeqCst),
            generated: self.state.generated.load(Ordering::Relaxed),
            served: self.state.served.load(Ordering::Relaxed),
            fallbacks: self.state.fallbacks.load(Ordering::Relaxed),
        }
    }

    fn launch(&self, workers: &mut JoinSet<Result<()>>) {
        let in_flight = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        workers.spawn_blocking(move || state.fill_one());
    }
}

/// Fold one finished worker into the run loop's result.
fn settle(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(VaultError::from)?
}

#[async_trait]
impl Service for KeyGenerator {
    fn name(&self) -> &str {
        "key-generator"
    }

    async fn on_start(&self, _token: &CancellationToken) -> std::result::Result<(), BoxError> {
        let config = self.state.config;
        info!(
            algorithm = self.state.source.algorithm(),
            max_pregenerated = config.max_pregenerated,
            max_concurrent = config.max_concurrent,
            "key pool starting"
        );
        Ok(())
    }

    async fn on_run(&self, token: CancellationToken) -> std::result::Result<(), BoxError> {
        let mut workers: JoinSet<Result<()>> = JoinSet::new();
        let mut failure: Option<VaultError> = None;

        while failure.is_none() && !token.is_cancelled() {
            while self.state.can_launch() {
                self.launch(&mut workers);
            }

            if workers.is_empty() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.state.config.idle_interval) => {}
                }
            } else {
                tokio::select! {
                    _ = token.cancelled() => break,
                    Some(joined) = workers.join_next() => {
                        if let Err(err) = settle(joined) {
                            failure = Some(err);
                        }
                    }
                }
            }
        }

        // Never abandon a generation mid-way; only new launches stop.
        let draining = workers.len();
        if draining > 0 {
            debug!(draining, "waiting for in-flight key workers");
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = settle(joined) {
                failure.get_or_insert(err);
            }
        }

        match failure {
            Some(err) => Err(err.into()),
            None => {
                info!(stats = ?self.stats(), "key pool stopped");
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
