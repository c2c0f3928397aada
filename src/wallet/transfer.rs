//! Transfer construction, pre-flight, and broadcast
//!
//! Transfers from one address are strictly serialized by a per-address
//! token; everything from the nonce read to the nonce-advance write happens
//! inside that critical section. Transfers from different addresses run in
//! parallel.

use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, TxKind, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use serde_json::{json, Value};

use super::{parse_address, WalletManager};
use crate::store::keystore::WalletRecord;
use crate::units;
use crate::{Error, Result};

/// Pre-flight snapshot of a prospective transfer. All amounts in wei.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub gas: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub fee: U256,
    pub total: U256,
    pub balance: U256,
    pub sufficient_balance: bool,
}

impl Simulation {
    /// Wire shape: decimal strings only, no floats.
    pub fn to_json(&self) -> Value {
        json!({
            "from": self.from.to_checksum(None),
            "to": self.to.to_checksum(None),
            "amount": units::format_native(self.amount),
            "gas": self.gas,
            "max_fee_per_gas": self.max_fee_per_gas.to_string(),
            "max_priority_fee_per_gas": self.max_priority_fee_per_gas.to_string(),
            "fee": units::format_native(self.fee),
            "total": units::format_native(self.total),
            "balance": units::format_native(self.balance),
            "sufficient_balance": self.sufficient_balance,
        })
    }
}

/// Arguments to [`WalletManager::execute_transfer`].
#[derive(Debug, Clone)]
pub struct TransferRequest<'a> {
    pub agent_id: &'a str,
    pub to: &'a str,
    /// Amount in wei.
    pub amount: U256,
    pub confirmation_code: Option<&'a str>,
    pub dry_run: bool,
}

/// What a transfer call produced.
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Broadcast { tx_hash: B256, nonce: u64 },
    DryRun(Simulation),
}

impl WalletManager {
    /// Pre-flight a transfer without acquiring the transfer token or
    /// touching any state.
    pub async fn simulate_transfer(
        &self,
        agent_id: &str,
        to: &str,
        amount: U256,
    ) -> Result<Simulation> {
        let to = parse_address(to)?;
        if amount.is_zero() {
            return Err(Error::InvalidArgument("amount must be positive".into()));
        }
        let record = self.load_for_chain(agent_id).await?;
        self.build_simulation(&record, to, amount).await
    }

    /// Execute the transfer algorithm.
    ///
    /// Steps, in order: address validation, chain check, token acquisition,
    /// nonce resolution, fee and gas quotes, balance pre-flight, spend
    /// threshold gate, optional dry-run exit, sign, broadcast, nonce
    /// advance. The per-address token is held from the nonce read until the
    /// nonce-advance commit (or a clean abort).
    pub async fn execute_transfer(&self, request: TransferRequest<'_>) -> Result<TransferOutcome> {
        let to = parse_address(request.to)?;
        if request.amount.is_zero() {
            return Err(Error::InvalidArgument("amount must be positive".into()));
        }
        let record = self.load_for_chain(request.agent_id).await?;
        let from = record.address;

        if self.is_quarantined(from) {
            return Err(Error::BroadcastAborted);
        }

        let token = self.transfer_token(from);
        let _guard = token.lock().await;

        // State may have moved while we waited on the token.
        if self.is_quarantined(from) {
            return Err(Error::BroadcastAborted);
        }
        let record = self.keystore.get(request.agent_id)?;

        // The chain is the source of truth for the next nonce, but a lagging
        // endpoint may still report an already-used one; our own committed
        // broadcasts put a floor under it.
        let pending = self.chain.pending_nonce(from).await?;
        let nonce = match record.last_nonce {
            Some(last) => pending.max(last + 1),
            None => pending,
        };

        let simulation = self.build_simulation(&record, to, request.amount).await?;
        if !simulation.sufficient_balance {
            return Err(Error::InsufficientFunds {
                needed: simulation.total.to_string(),
                available: simulation.balance.to_string(),
            });
        }

        self.enforce_spend_threshold(request.amount, request.confirmation_code)?;

        if request.dry_run {
            return Ok(TransferOutcome::DryRun(simulation));
        }

        let raw = self.sign_eip1559(
            request.agent_id,
            &record,
            to,
            request.amount,
            nonce,
            &simulation,
        )?;

        let tx_hash = self.chain.send_raw(&raw).await?;

        // The broadcast is out. If this write fails the address must not
        // issue another transfer: a retry would re-use the nonce.
        if let Err(e) = self.keystore.advance_nonce(request.agent_id, nonce) {
            self.quarantine(from);
            tracing::error!(
                agent_id = %request.agent_id,
                tx_hash = %tx_hash,
                nonce,
                error = %e,
                "nonce advance failed after accepted broadcast; address quarantined"
            );
            return Err(Error::BroadcastAborted);
        }

        tracing::info!(
            agent_id = %request.agent_id,
            tx_hash = %tx_hash,
            nonce,
            amount = %units::format_native(request.amount),
            "transfer broadcast"
        );
        Ok(TransferOutcome::Broadcast { tx_hash, nonce })
    }

    /// Load the wallet record and reject a chain-id mismatch.
    async fn load_for_chain(&self, agent_id: &str) -> Result<WalletRecord> {
        let record = self.keystore.get(agent_id)?;
        let active = self.chain.status().await?.chain_id;
        if record.chain_id != active {
            return Err(Error::Config(format!(
                "wallet '{agent_id}' belongs to chain {} but the active chain is {active}",
                record.chain_id
            )));
        }
        Ok(record)
    }

    async fn build_simulation(
        &self,
        record: &WalletRecord,
        to: Address,
        amount: U256,
    ) -> Result<Simulation> {
        let fees = self.chain.fee_suggestion().await?;
        let gas = self
            .chain
            .estimate_gas(record.address, to, amount, None)
            .await?;
        let fee = U256::from(gas)
            .checked_mul(U256::from(fees.max_fee_per_gas))
            .ok_or_else(|| Error::InvalidArgument("fee overflows".into()))?;
        let total = amount
            .checked_add(fee)
            .ok_or_else(|| Error::InvalidArgument("total overflows".into()))?;
        let balance = self.chain.balance(record.address).await?;

        Ok(Simulation {
            from: record.address,
            to,
            amount,
            gas,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            fee,
            total,
            balance,
            sufficient_balance: balance >= total,
        })
    }

    fn enforce_spend_threshold(&self, amount: U256, supplied: Option<&str>) -> Result<()> {
        let Some(threshold) = self.config.spend_threshold_wei else {
            return Ok(());
        };
        if amount <= threshold {
            return Ok(());
        }
        let Some(supplied) = supplied else {
            return Err(Error::ConfirmationRequired);
        };
        match self.config.confirmation_code.as_deref() {
            Some(expected) if supplied == expected => Ok(()),
            _ => Err(Error::ConfirmationMismatch),
        }
    }

    fn sign_eip1559(
        &self,
        agent_id: &str,
        record: &WalletRecord,
        to: Address,
        amount: U256,
        nonce: u64,
        simulation: &Simulation,
    ) -> Result<Vec<u8>> {
        let key = self.keystore.decrypt(agent_id)?;
        let signer = PrivateKeySigner::from_slice(&key).map_err(|_| Error::DecryptFailed)?;
        drop(key);
        if signer.address() != record.address {
            return Err(Error::DecryptFailed);
        }

        let mut tx = TxEip1559 {
            chain_id: record.chain_id,
            nonce,
            gas_limit: simulation.gas,
            max_fee_per_gas: simulation.max_fee_per_gas,
            max_priority_fee_per_gas: simulation.max_priority_fee_per_gas,
            to: TxKind::Call(to),
            value: amount,
            ..Default::default()
        };
        let signature = signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| Error::Storage(format!("signing failed: {e}")))?;
        let envelope = TxEnvelope::Eip1559(tx.into_signed(signature));
        Ok(envelope.encoded_2718())
    }

    /// The per-address serialization token. One token per lowercase
    /// address, created on first use; the outer map lock is short-lived.
    fn transfer_token(&self, address: Address) -> std::sync::Arc<tokio::sync::Mutex<()>> {
        let key = format!("{address:#x}");
        let mut tokens = match self.transfer_tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tokens
            .entry(key)
            .or_insert_with(|| std::sync::Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn is_quarantined(&self, address: Address) -> bool {
        match self.quarantined.lock() {
            Ok(guard) => guard.contains(&address),
            Err(poisoned) => poisoned.into_inner().contains(&address),
        }
    }

    fn quarantine(&self, address: Address) {
        let mut set = match self.quarantined.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.insert(address);
    }
}
