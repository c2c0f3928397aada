//! Shared test fixtures
//!
//! A scripted [`MockChainClient`] plugged into the [`ChainClient`] seam,
//! plus builders wiring managers against an in-memory database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use alloy::consensus::{SignableTransaction, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::chain::{ChainClient, ChainStatus, FeeSuggestion, ReceiptSummary};
use crate::config::{Config, RateLimits};
use crate::policy::PolicyEngine;
use crate::store::journal::EventJournal;
use crate::store::keystore::KeyStore;
use crate::store::strategies::StrategyStore;
use crate::store::Db;
use crate::strategy::StrategyManager;
use crate::tools::ToolRouter;
use crate::units;
use crate::wallet::WalletManager;
use crate::{Error, Result};

/// Well-known development key (hardhat/anvil account #0).
pub const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

/// Standard destination used across transfer tests.
pub const DEST: &str = "0x0000000000000000000000000000000000000001";

pub const TEST_CHAIN_ID: u64 = 31337;

/// One broadcast the mock accepted.
#[allow(dead_code)] // Fields mirror the decoded transaction for debugging
pub struct SentTx {
    pub hash: B256,
    pub from: Address,
    pub nonce: u64,
    pub value: U256,
}

/// Scripted chain: balances, nonces, and fees are plain maps; broadcasts
/// are decoded and recorded.
pub struct MockChainClient {
    balances: StdMutex<HashMap<Address, U256>>,
    nonces: StdMutex<HashMap<Address, u64>>,
    code: StdMutex<HashMap<Address, Bytes>>,
    base_fee: StdMutex<u128>,
    sent: StdMutex<Vec<SentTx>>,
    fail_send: StdMutex<Option<String>>,
}

impl MockChainClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            balances: StdMutex::new(HashMap::new()),
            nonces: StdMutex::new(HashMap::new()),
            code: StdMutex::new(HashMap::new()),
            base_fee: StdMutex::new(units::gwei_to_wei(1)),
            sent: StdMutex::new(Vec::new()),
            fail_send: StdMutex::new(None),
        })
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.balances.lock().unwrap().insert(address, balance);
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.nonces.lock().unwrap().insert(address, nonce);
    }

    pub fn set_base_fee_gwei(&self, gwei: u64) {
        *self.base_fee.lock().unwrap() = units::gwei_to_wei(gwei);
    }

    pub fn set_code(&self, address: Address, code: Vec<u8>) {
        self.code.lock().unwrap().insert(address, code.into());
    }

    /// Make the next `send_raw` fail as a node-level rejection.
    pub fn fail_next_send(&self, reason: &str) {
        *self.fail_send.lock().unwrap() = Some(reason.to_string());
    }

    /// Nonces of accepted broadcasts, in acceptance order.
    pub fn broadcast_nonces(&self) -> Vec<u64> {
        self.sent.lock().unwrap().iter().map(|tx| tx.nonce).collect()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn status(&self) -> Result<ChainStatus> {
        Ok(ChainStatus {
            chain_id: TEST_CHAIN_ID,
            latest_block: 1,
            base_fee_per_gas: *self.base_fee.lock().unwrap(),
        })
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64> {
        Ok(self
            .nonces
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    async fn estimate_gas(
        &self,
        _from: Address,
        _to: Address,
        _value: U256,
        _data: Option<Bytes>,
    ) -> Result<u64> {
        Ok(21_000)
    }

    async fn fee_suggestion(&self) -> Result<FeeSuggestion> {
        let base = *self.base_fee.lock().unwrap();
        let tip = units::gwei_to_wei(1);
        Ok(FeeSuggestion {
            max_fee_per_gas: base * 2 + tip,
            max_priority_fee_per_gas: tip,
        })
    }

    async fn send_raw(&self, tx: &[u8]) -> Result<B256> {
        if let Some(reason) = self.fail_send.lock().unwrap().take() {
            return Err(Error::RpcRejected(reason));
        }

        let envelope = TxEnvelope::decode_2718(&mut &tx[..])
            .map_err(|e| Error::RpcRejected(format!("undecodable transaction: {e}")))?;
        let signed = envelope
            .as_eip1559()
            .ok_or_else(|| Error::RpcRejected("expected an EIP-1559 transaction".into()))?;
        let inner = signed.tx();
        let from = signed
            .signature()
            .recover_address_from_prehash(&inner.signature_hash())
            .map_err(|e| Error::RpcRejected(format!("unrecoverable signer: {e}")))?;

        let hash = keccak256(tx);
        {
            let mut nonces = self.nonces.lock().unwrap();
            nonces.insert(from, inner.nonce + 1);
        }
        {
            let mut balances = self.balances.lock().unwrap();
            let balance = balances.entry(from).or_insert(U256::ZERO);
            *balance = balance.saturating_sub(inner.value);
        }
        self.sent.lock().unwrap().push(SentTx {
            hash,
            from,
            nonce: inner.nonce,
            value: inner.value,
        });
        Ok(hash)
    }

    async fn wait_receipt(&self, tx_hash: B256, _timeout: Duration) -> Result<ReceiptSummary> {
        Ok(ReceiptSummary {
            tx_hash,
            success: true,
            block_number: Some(2),
        })
    }

    async fn code_at(&self, address: Address) -> Result<Bytes> {
        Ok(self
            .code
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_default())
    }
}

fn build_manager(config: Config) -> (WalletManager, Arc<MockChainClient>) {
    let mock = MockChainClient::new();
    let db = Db::open_in_memory().unwrap();
    let keystore = KeyStore::open(db, &[7u8; 32]).unwrap();
    let manager = WalletManager::new(Arc::new(config), mock.clone(), keystore);
    (manager, mock)
}

pub fn manager_with_mock() -> (WalletManager, Arc<MockChainClient>) {
    build_manager(Config::default())
}

pub fn manager_with_export_enabled(export_code: &str) -> (WalletManager, Arc<MockChainClient>) {
    build_manager(Config {
        allow_plaintext_export: true,
        export_code: Some(export_code.to_string()),
        ..Config::default()
    })
}

/// A manager with one funded wallet.
pub async fn funded_manager(agent_id: &str, balance: &str) -> (WalletManager, Arc<MockChainClient>) {
    let (manager, mock) = manager_with_mock();
    let address = manager.create_wallet(agent_id).await.unwrap();
    mock.set_balance(address, units::parse_native(balance).unwrap());
    (manager, mock)
}

/// A funded manager with a spend threshold and confirmation code.
pub async fn manager_with_threshold(
    agent_id: &str,
    balance: &str,
    threshold: &str,
    code: &str,
) -> (WalletManager, Arc<MockChainClient>) {
    let (manager, mock) = build_manager(Config {
        spend_threshold_wei: Some(units::parse_native(threshold).unwrap()),
        confirmation_code: Some(code.to_string()),
        ..Config::default()
    });
    let address = manager.create_wallet(agent_id).await.unwrap();
    mock.set_balance(address, units::parse_native(balance).unwrap());
    (manager, mock)
}

/// Wallet + strategy managers sharing one database and mock chain.
pub async fn strategy_fixture(
    agent_id: &str,
    balance: &str,
) -> (StrategyManager, Arc<WalletManager>, Arc<MockChainClient>) {
    let mock = MockChainClient::new();
    let db = Db::open_in_memory().unwrap();
    let keystore = KeyStore::open(db.clone(), &[7u8; 32]).unwrap();
    let wallet = Arc::new(WalletManager::new(
        Arc::new(Config::default()),
        mock.clone(),
        keystore,
    ));
    let address = wallet.create_wallet(agent_id).await.unwrap();
    mock.set_balance(address, units::parse_native(balance).unwrap());

    let strategies = StrategyManager::new(StrategyStore::new(db), wallet.clone(), mock.clone());
    (strategies, wallet, mock)
}

/// Full stack behind the tool router, with the given config.
pub async fn router_fixture(config: Config) -> (ToolRouter, Arc<MockChainClient>) {
    let config = Arc::new(config);
    let mock = MockChainClient::new();
    let db = Db::open_in_memory().unwrap();
    let keystore = KeyStore::open(db.clone(), &[7u8; 32]).unwrap();
    let wallet = Arc::new(WalletManager::new(config.clone(), mock.clone(), keystore));
    let strategies = Arc::new(StrategyManager::new(
        StrategyStore::new(db.clone()),
        wallet.clone(),
        mock.clone(),
    ));
    let policy = Arc::new(PolicyEngine::new(config, EventJournal::new(db)));
    (ToolRouter::new(wallet, strategies, policy), mock)
}

/// Router with default config plus the given rate-limit rules.
pub async fn router_with_limits(rate_limits: RateLimits) -> (ToolRouter, Arc<MockChainClient>) {
    router_fixture(Config {
        rate_limits,
        ..Config::default()
    })
    .await
}
