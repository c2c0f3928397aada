//! HTTP chain client with endpoint failover
//!
//! Configured with an ordered endpoint list. Every operation walks the list
//! starting from the endpoint that last succeeded; transport-layer failures
//! rotate to the next endpoint, and the call fails `chain_unreachable` only
//! once the whole list is exhausted. A node-level rejection (the endpoint
//! parsed the request and said no) is final and never retried elsewhere,
//! which keeps `send_raw` at-most-once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::transports::{RpcError, TransportError};
use async_trait::async_trait;
use url::Url;

use super::{ChainClient, ChainStatus, FeeSuggestion, ReceiptSummary};
use crate::config::Config;
use crate::{Error, Result};

/// Floor for the suggested priority fee: 0.1 gwei.
const MIN_PRIORITY_FEE_WEI: u128 = 100_000_000;

/// How often `wait_receipt` polls.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct HttpChainClient {
    endpoints: Vec<Url>,
    timeout: Duration,
    fee_tip_percentile: f64,
    fee_history_blocks: u64,
    /// Index of the endpoint that last answered; next calls start here.
    cursor: AtomicUsize,
}

impl HttpChainClient {
    pub fn new(config: &Config) -> Result<Self> {
        if config.rpc_urls.is_empty() {
            return Err(Error::Config("at least one RPC endpoint is required".into()));
        }
        let endpoints = config
            .rpc_urls
            .iter()
            .map(|raw| {
                Url::parse(raw).map_err(|e| Error::Config(format!("invalid RPC URL '{raw}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            endpoints,
            timeout: config.chain_call_timeout,
            fee_tip_percentile: config.fee_tip_percentile,
            fee_history_blocks: config.fee_history_blocks,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Endpoint indices in attempt order, starting from the sticky cursor.
    fn attempt_order(&self) -> Vec<usize> {
        rotation_order(self.cursor.load(Ordering::Relaxed), self.endpoints.len())
    }

    fn mark_healthy(&self, idx: usize) {
        self.cursor.store(idx, Ordering::Relaxed);
    }

    fn provider_at(&self, idx: usize) -> impl Provider {
        ProviderBuilder::new().connect_http(self.endpoints[idx].clone())
    }

    /// Run one provider future under the configured timeout.
    async fn bounded<T, F>(&self, fut: F) -> std::result::Result<T, String>
    where
        F: std::future::IntoFuture<Output = std::result::Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Err(_) => Err("timed out".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(v)) => Ok(v),
        }
    }
}

/// Indices `start, start+1, ..` wrapping over `len` entries.
fn rotation_order(start: usize, len: usize) -> Vec<usize> {
    (0..len).map(|i| (start + i) % len).collect()
}

/// Median of the requested-percentile rewards across sampled blocks.
fn median_tip(rewards: &[Vec<u128>]) -> Option<u128> {
    let mut tips: Vec<u128> = rewards
        .iter()
        .filter_map(|block| block.first().copied())
        .filter(|tip| *tip > 0)
        .collect();
    if tips.is_empty() {
        return None;
    }
    tips.sort_unstable();
    Some(tips[tips.len() / 2])
}

/// `max_fee = 2 * base_fee + tip`: survives one full base-fee doubling.
fn compose_max_fee(base_fee: u128, tip: u128) -> u128 {
    base_fee.saturating_mul(2).saturating_add(tip)
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn status(&self) -> Result<ChainStatus> {
        let mut last_err = String::new();
        for idx in self.attempt_order() {
            let provider = self.provider_at(idx);
            let chain_id = match self.bounded(provider.get_chain_id()).await {
                Ok(v) => v,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            let latest_block = match self.bounded(provider.get_block_number()).await {
                Ok(v) => v,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            let history = match self
                .bounded(provider.get_fee_history(1, BlockNumberOrTag::Latest, &[]))
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            self.mark_healthy(idx);
            return Ok(ChainStatus {
                chain_id,
                latest_block,
                base_fee_per_gas: history.base_fee_per_gas.last().copied().unwrap_or_default(),
            });
        }
        Err(Error::ChainUnreachable(last_err))
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        let mut last_err = String::new();
        for idx in self.attempt_order() {
            let provider = self.provider_at(idx);
            match self.bounded(provider.get_balance(address)).await {
                Ok(v) => {
                    self.mark_healthy(idx);
                    return Ok(v);
                }
                Err(e) => last_err = e,
            }
        }
        Err(Error::ChainUnreachable(last_err))
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64> {
        let mut last_err = String::new();
        for idx in self.attempt_order() {
            let provider = self.provider_at(idx);
            match self
                .bounded(provider.get_transaction_count(address).pending())
                .await
            {
                Ok(v) => {
                    self.mark_healthy(idx);
                    return Ok(v);
                }
                Err(e) => last_err = e,
            }
        }
        Err(Error::ChainUnreachable(last_err))
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Option<Bytes>,
    ) -> Result<u64> {
        let mut tx = TransactionRequest::default().from(from).to(to).value(value);
        if let Some(data) = data {
            tx = tx.input(data.into());
        }

        let mut last_err = String::new();
        for idx in self.attempt_order() {
            let provider = self.provider_at(idx);
            match tokio::time::timeout(self.timeout, provider.estimate_gas(tx.clone())).await {
                Err(_) => last_err = "timed out".to_string(),
                Ok(Ok(gas)) => {
                    self.mark_healthy(idx);
                    return Ok(gas);
                }
                // The node answered: the estimate itself is rejected, not
                // the transport. Surface it instead of rotating.
                Ok(Err(RpcError::ErrorResp(payload))) => {
                    return Err(Error::RpcRejected(payload.message.to_string()));
                }
                Ok(Err(e)) => last_err = e.to_string(),
            }
        }
        Err(Error::ChainUnreachable(last_err))
    }

    async fn fee_suggestion(&self) -> Result<FeeSuggestion> {
        let mut last_err = String::new();
        for idx in self.attempt_order() {
            let provider = self.provider_at(idx);
            let history = match self
                .bounded(provider.get_fee_history(
                    self.fee_history_blocks,
                    BlockNumberOrTag::Latest,
                    &[self.fee_tip_percentile],
                ))
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            self.mark_healthy(idx);

            let base_fee = history.base_fee_per_gas.last().copied().unwrap_or_default();
            let tip = history
                .reward
                .as_deref()
                .and_then(median_tip)
                .unwrap_or(MIN_PRIORITY_FEE_WEI)
                .max(MIN_PRIORITY_FEE_WEI);
            return Ok(FeeSuggestion {
                max_fee_per_gas: compose_max_fee(base_fee, tip),
                max_priority_fee_per_gas: tip,
            });
        }
        Err(Error::ChainUnreachable(last_err))
    }

    async fn send_raw(&self, tx: &[u8]) -> Result<B256> {
        let mut last_err = String::new();
        for idx in self.attempt_order() {
            let provider = self.provider_at(idx);
            match tokio::time::timeout(self.timeout, provider.send_raw_transaction(tx)).await {
                Err(_) => last_err = "timed out".to_string(),
                Ok(Ok(pending)) => {
                    // The endpoint accepted the broadcast: from here on the
                    // transaction exists, so no further attempts anywhere.
                    self.mark_healthy(idx);
                    return Ok(*pending.tx_hash());
                }
                Ok(Err(RpcError::ErrorResp(payload))) => {
                    return Err(Error::RpcRejected(payload.message.to_string()));
                }
                Ok(Err(e)) => last_err = e.to_string(),
            }
        }
        Err(Error::ChainUnreachable(last_err))
    }

    async fn wait_receipt(&self, tx_hash: B256, timeout: Duration) -> Result<ReceiptSummary> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut last_err = String::new();
            for idx in self.attempt_order() {
                let provider = self.provider_at(idx);
                match self.bounded(provider.get_transaction_receipt(tx_hash)).await {
                    Ok(Some(receipt)) => {
                        self.mark_healthy(idx);
                        return Ok(ReceiptSummary {
                            tx_hash,
                            success: receipt.status(),
                            block_number: receipt.block_number,
                        });
                    }
                    Ok(None) => {
                        self.mark_healthy(idx);
                        last_err.clear();
                        break;
                    }
                    Err(e) => last_err = e,
                }
            }

            if tokio::time::Instant::now() + RECEIPT_POLL_INTERVAL > deadline {
                let reason = if last_err.is_empty() {
                    "receipt not available before timeout".to_string()
                } else {
                    last_err
                };
                return Err(Error::ChainUnreachable(reason));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    async fn code_at(&self, address: Address) -> Result<Bytes> {
        let mut last_err = String::new();
        for idx in self.attempt_order() {
            let provider = self.provider_at(idx);
            match self.bounded(provider.get_code_at(address)).await {
                Ok(v) => {
                    self.mark_healthy(idx);
                    return Ok(v);
                }
                Err(e) => last_err = e,
            }
        }
        Err(Error::ChainUnreachable(last_err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_starts_at_cursor_and_wraps() {
        assert_eq!(rotation_order(0, 3), vec![0, 1, 2]);
        assert_eq!(rotation_order(1, 3), vec![1, 2, 0]);
        assert_eq!(rotation_order(2, 3), vec![2, 0, 1]);
        assert_eq!(rotation_order(0, 1), vec![0]);
    }

    #[test]
    fn median_tip_takes_middle_sample() {
        let rewards = vec![vec![3_000_000_000], vec![1_000_000_000], vec![2_000_000_000]];
        assert_eq!(median_tip(&rewards), Some(2_000_000_000));
    }

    #[test]
    fn median_tip_skips_empty_and_zero_blocks() {
        let rewards = vec![vec![], vec![0], vec![5_000_000_000]];
        assert_eq!(median_tip(&rewards), Some(5_000_000_000));
        assert_eq!(median_tip(&[]), None);
        assert_eq!(median_tip(&[vec![0]]), None);
    }

    #[test]
    fn max_fee_doubles_base_and_adds_tip() {
        assert_eq!(compose_max_fee(10, 3), 23);
        assert_eq!(compose_max_fee(u128::MAX, 1), u128::MAX);
    }

    #[test]
    fn rejects_unparseable_endpoint() {
        let config = Config {
            rpc_urls: vec!["not a url".into()],
            ..Config::default()
        };
        assert!(HttpChainClient::new(&config).is_err());
    }
}
