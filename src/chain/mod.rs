//! EVM chain access
//!
//! [`ChainClient`] is the seam between the wallet core and JSON-RPC. The
//! production implementation ([`HttpChainClient`]) talks to an ordered list
//! of HTTP endpoints with failover; tests substitute a scripted mock.

mod http;

pub use http::HttpChainClient;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use std::time::Duration;

use crate::Result;

/// Snapshot of the connected chain.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChainStatus {
    pub chain_id: u64,
    pub latest_block: u64,
    /// Base fee of the next block, in wei.
    pub base_fee_per_gas: u128,
}

/// EIP-1559 fee suggestion, both components in wei.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct FeeSuggestion {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// The subset of a transaction receipt the core cares about.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReceiptSummary {
    pub tx_hash: B256,
    pub success: bool,
    pub block_number: Option<u64>,
}

/// Abstract EVM JSON-RPC client.
///
/// Every call carries the deployment-configured timeout; timeouts and
/// exhausted endpoints surface as `chain_unreachable`. `send_raw` is
/// at-most-once: once any endpoint accepts the broadcast and returns a
/// hash, the call never retries elsewhere.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain id, latest block number, and next-block base fee.
    async fn status(&self) -> Result<ChainStatus>;

    /// Native balance in wei.
    async fn balance(&self, address: Address) -> Result<U256>;

    /// The chain's next usable nonce for `address`, pending-inclusive.
    async fn pending_nonce(&self, address: Address) -> Result<u64>;

    /// Gas estimate for the exact call.
    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Option<Bytes>,
    ) -> Result<u64>;

    /// Fee suggestion built from the latest base fee plus a recent-block
    /// percentile tip (see the config knobs for percentile and lookback).
    async fn fee_suggestion(&self) -> Result<FeeSuggestion>;

    /// Broadcast a signed, RLP-encoded transaction.
    async fn send_raw(&self, tx: &[u8]) -> Result<B256>;

    /// Poll for the receipt of `tx_hash` until `timeout` elapses.
    async fn wait_receipt(&self, tx_hash: B256, timeout: Duration) -> Result<ReceiptSummary>;

    /// Deployed bytecode at `address` (empty for EOAs).
    async fn code_at(&self, address: Address) -> Result<Bytes>;
}
