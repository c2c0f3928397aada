//! AgentVault
//!
//! Custodial wallet and strategy execution core for autonomous agents on an
//! EVM chain. Each agent owns exactly one externally-owned account whose
//! signing key is held encrypted at rest; the core mediates balance
//! queries, transaction construction, signing, broadcast, and recurring
//! strategy execution under a policy layer that enforces rate limits and
//! high-value confirmation.
//!
//! # Security Model
//!
//! - Private keys are encrypted with an authenticated cipher and only ever
//!   decrypted into zeroizing buffers inside the wallet module
//! - Every tool call passes through the policy engine: rate limit before,
//!   redacted audit record after
//! - Transfers per address are strictly serialized; nonces never regress
//! - Plaintext key export is double-gated and off by default

pub mod chain;
pub mod config;
pub mod policy;
pub mod store;
pub mod strategy;
pub mod tools;
pub mod units;
pub mod wallet;

mod error;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

pub use config::Config;
pub use error::{Error, Result};

/// Wire the full core from a loaded configuration: database, key store,
/// chain client, managers, policy engine, tool router.
pub fn bootstrap(config: Config) -> Result<tools::ToolRouter> {
    let secret = match &config.encryption_secret {
        Some(raw) => store::keystore::parse_secret_hex(raw)?,
        None => store::keystore::load_or_create_secret(&config.sidecar_secret_path())?,
    };

    let config = Arc::new(config);
    let db = store::Db::open(&config.database_path)?;
    let keystore = store::keystore::KeyStore::open(db.clone(), &secret)?;
    let chain: Arc<dyn chain::ChainClient> = Arc::new(chain::HttpChainClient::new(&config)?);

    let wallet = Arc::new(wallet::WalletManager::new(
        config.clone(),
        chain.clone(),
        keystore,
    ));
    let strategies = Arc::new(strategy::StrategyManager::new(
        store::strategies::StrategyStore::new(db.clone()),
        wallet.clone(),
        chain,
    ));
    let policy = Arc::new(policy::PolicyEngine::new(
        config,
        store::journal::EventJournal::new(db),
    ));

    Ok(tools::ToolRouter::new(wallet, strategies, policy))
}
