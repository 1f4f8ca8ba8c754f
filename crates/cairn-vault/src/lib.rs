//! Key material for Cairn.
//!
//! This crate owns everything that produces asymmetric key pairs: the
//! cryptosystem behind them and the background pool that keeps fresh pairs
//! ready for the rest of the server.
//!
//! # Modules
//!
//! - [`crypto`] -- [`KeyPair`], the [`KeyPairSource`] seam, Ed25519 via `ring`.
//! - [`pool`] -- [`KeyGenerator`], the pregeneration pool service.
//! - [`error`] -- Unified error types.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cairn_kernel::{CancellationToken, Lifetime};
//! use cairn_vault::{KeyGenerator, KeyPoolConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let pool = Arc::new(KeyGenerator::new(KeyPoolConfig::default()));
//! let lifetime = Lifetime::new(pool.clone());
//! lifetime.start(&CancellationToken::new()).await?;
//!
//! // Pops a pregenerated pair, or generates one inline if none is ready.
//! let pair = pool.get_new()?;
//! assert!(!pair.public_key.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod pool;

// Re-export the most commonly used types at the crate root for convenience.
pub use crypto::{Ed25519Source, KeyPair, KeyPairSource};
pub use error::{Result, VaultError};
pub use pool::{KeyGenerator, KeyPoolConfig, KeyPoolStats};
