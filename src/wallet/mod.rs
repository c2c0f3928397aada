//! Wallet management
//!
//! The [`WalletManager`] owns key lifecycle (create, import, export),
//! message signing, and every chain-touching wallet operation. Private keys
//! live encrypted in the key store; decrypted bytes exist only inside
//! zeroizing buffers and inside alloy's [`PrivateKeySigner`], which never
//! serializes them.

mod transfer;

pub use transfer::{Simulation, TransferOutcome, TransferRequest};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use alloy::hex;
use alloy::primitives::{eip191_hash_message, Address, Signature, B256, U256};
use alloy::signers::local::coins_bip39::{English, Mnemonic};
use alloy::signers::local::{MnemonicBuilder, PrivateKeySigner};
use alloy::signers::SignerSync;
use serde_json::{json, Value};
use zeroize::Zeroizing;

use crate::chain::ChainClient;
use crate::config::Config;
use crate::store::keystore::KeyStore;
use crate::units;
use crate::{Error, Result};

/// How many fresh keys to draw before giving up on an address collision.
const CREATE_RETRIES: usize = 3;

/// Parse and canonicalize a destination address.
pub(crate) fn parse_address(raw: &str) -> Result<Address> {
    raw.trim()
        .parse::<Address>()
        .map_err(|_| Error::BadAddress(raw.to_string()))
}

pub struct WalletManager {
    config: Arc<Config>,
    chain: Arc<dyn ChainClient>,
    keystore: KeyStore,
    /// Per-address serialization tokens, keyed by lowercase address.
    transfer_tokens: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Addresses with an accepted broadcast whose nonce advance failed.
    /// Transfers for these fail until an operator restarts the process.
    quarantined: StdMutex<HashSet<Address>>,
    http: reqwest::Client,
}

impl WalletManager {
    pub fn new(config: Arc<Config>, chain: Arc<dyn ChainClient>, keystore: KeyStore) -> Self {
        Self {
            config,
            chain,
            keystore,
            transfer_tokens: StdMutex::new(HashMap::new()),
            quarantined: StdMutex::new(HashSet::new()),
            http: reqwest::Client::new(),
        }
    }

    /// Generate a fresh key for `agent_id` and persist it.
    pub async fn create_wallet(&self, agent_id: &str) -> Result<Address> {
        let chain_id = self.chain.status().await?.chain_id;

        let mut last_err = Error::AddressReuse;
        for _ in 0..CREATE_RETRIES {
            let signer = PrivateKeySigner::random();
            let address = signer.address();
            let key = Zeroizing::new(signer.credential().to_bytes().to_vec());
            match self
                .keystore
                .put(agent_id, address, &key, chain_id, json!({}))
            {
                Ok(_) => {
                    tracing::info!(agent_id = %agent_id, address = %address, "wallet created");
                    return Ok(address);
                }
                // A fresh random key colliding on address is astronomically
                // unlikely; retrying is still cheaper than failing the call.
                Err(Error::AddressReuse) => last_err = Error::AddressReuse,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Import a raw hex private key.
    pub async fn import_wallet_privkey(&self, agent_id: &str, private_key: &str) -> Result<Address> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .trim_start_matches("0x")
            .parse()
            .map_err(|_| Error::BadKey)?;
        self.store_imported(agent_id, signer, "privkey").await
    }

    /// Import from a BIP-39 mnemonic phrase (first account).
    pub async fn import_wallet_mnemonic(&self, agent_id: &str, mnemonic: &str) -> Result<Address> {
        let signer = MnemonicBuilder::<English>::default()
            .phrase(mnemonic.trim())
            .build()
            .map_err(|_| Error::BadKey)?;
        self.store_imported(agent_id, signer, "mnemonic").await
    }

    /// Import from an encrypted keystore JSON document.
    pub async fn import_wallet_keystore(
        &self,
        agent_id: &str,
        keystore_json: &str,
        passphrase: &str,
    ) -> Result<Address> {
        let dir = tempfile::tempdir()
            .map_err(|e| Error::Storage(format!("keystore scratch dir: {e}")))?;
        let path = dir.path().join("import");
        std::fs::write(&path, keystore_json)
            .map_err(|e| Error::Storage(format!("keystore scratch file: {e}")))?;

        let key = Zeroizing::new(
            eth_keystore::decrypt_key(&path, passphrase).map_err(|_| Error::BadKey)?,
        );
        let signer = PrivateKeySigner::from_slice(&key).map_err(|_| Error::BadKey)?;
        self.store_imported(agent_id, signer, "keystore").await
    }

    async fn store_imported(
        &self,
        agent_id: &str,
        signer: PrivateKeySigner,
        source: &str,
    ) -> Result<Address> {
        let chain_id = self.chain.status().await?.chain_id;
        let address = signer.address();
        let key = Zeroizing::new(signer.credential().to_bytes().to_vec());
        self.keystore
            .put(agent_id, address, &key, chain_id, json!({ "imported": source }))?;
        tracing::info!(agent_id = %agent_id, address = %address, source = source, "wallet imported");
        Ok(address)
    }

    /// Generate a fresh BIP-39 mnemonic without persisting anything.
    pub fn generate_mnemonic(&self, word_count: usize) -> Result<String> {
        if !matches!(word_count, 12 | 15 | 18 | 21 | 24) {
            return Err(Error::InvalidArgument(format!(
                "unsupported mnemonic length {word_count}"
            )));
        }
        let mnemonic = Mnemonic::<English>::new_with_count(&mut rand::rngs::OsRng, word_count)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        Ok(mnemonic.to_phrase())
    }

    /// All `(agent_id, address)` pairs.
    pub fn list_wallets(&self) -> Result<Vec<(String, Address)>> {
        self.keystore.list()
    }

    /// Address of an existing wallet, or `not_found`.
    pub fn wallet_address(&self, agent_id: &str) -> Result<Address> {
        Ok(self.keystore.get(agent_id)?.address)
    }

    /// Native balance of the agent's address, in wei.
    pub async fn query_balance(&self, agent_id: &str) -> Result<U256> {
        let record = self.keystore.get(agent_id)?;
        let balance = self.chain.balance(record.address).await?;
        tracing::info!(agent_id = %agent_id, balance = %units::format_native(balance), "balance queried");
        Ok(balance)
    }

    /// Chain id, head block, base fee, and the current fee suggestion.
    pub async fn provider_status(&self) -> Result<Value> {
        let status = self.chain.status().await?;
        let fees = self.chain.fee_suggestion().await?;
        Ok(json!({
            "chain_id": status.chain_id,
            "latest_block": status.latest_block,
            "base_fee_per_gas_gwei": units::wei_to_gwei(status.base_fee_per_gas).to_string(),
            "max_fee_per_gas": fees.max_fee_per_gas.to_string(),
            "max_priority_fee_per_gas": fees.max_priority_fee_per_gas.to_string(),
        }))
    }

    /// Basic on-chain facts about an arbitrary address.
    pub async fn inspect_contract(&self, address: &str) -> Result<Value> {
        let address = parse_address(address)?;
        let code = self.chain.code_at(address).await?;
        let balance = self.chain.balance(address).await?;
        let is_contract = !code.is_empty();

        let mut out = json!({
            "address": address.to_checksum(None),
            "is_contract": is_contract,
            "balance": units::format_native(balance),
            "bytecode_length": code.len(),
        });
        if is_contract {
            out["bytecode_hash"] = json!(alloy::primitives::keccak256(&code).to_string());
        }
        Ok(out)
    }

    /// Re-encrypt the agent's key under a caller-supplied passphrase using
    /// the standard keystore format. Safe by default.
    pub fn export_keystore(&self, agent_id: &str, passphrase: &str) -> Result<String> {
        let key = self.keystore.decrypt(agent_id)?;
        let dir = tempfile::tempdir()
            .map_err(|e| Error::Storage(format!("keystore scratch dir: {e}")))?;
        eth_keystore::encrypt_key(
            dir.path(),
            &mut rand::rngs::OsRng,
            &key[..],
            passphrase,
            Some("export"),
        )
        .map_err(|e| Error::Storage(format!("keystore export: {e}")))?;
        std::fs::read_to_string(dir.path().join("export"))
            .map_err(|e| Error::Storage(format!("keystore export: {e}")))
    }

    /// Plaintext key export, gated by two independent deployment switches.
    ///
    /// Failing either gate yields `export_denied` before the store is
    /// touched, so the response does not reveal whether the agent exists.
    pub fn export_private_key(
        &self,
        agent_id: &str,
        confirmation_code: Option<&str>,
    ) -> Result<String> {
        if !self.config.allow_plaintext_export {
            return Err(Error::ExportDenied);
        }
        let expected = self.config.export_code.as_deref();
        if expected.is_none() || confirmation_code != expected {
            return Err(Error::ExportDenied);
        }

        let key = self.keystore.decrypt(agent_id)?;
        tracing::warn!(agent_id = %agent_id, "plaintext private key exported");
        Ok(format!("0x{}", hex::encode(&key[..])))
    }

    /// Sign a message with the EIP-191 personal-message prefix.
    pub fn sign_message(&self, agent_id: &str, message: &str) -> Result<Value> {
        let hash = eip191_hash_message(message.as_bytes());
        let signature = self.sign_prehash(agent_id, hash)?;
        Ok(json!({
            "signature": format!("0x{}", hex::encode(signature.as_bytes())),
            "message_hash": hash.to_string(),
        }))
    }

    /// Check an EIP-191 signature against an address.
    pub fn verify_message(&self, address: &str, message: &str, signature: &str) -> Result<Value> {
        let address = parse_address(address)?;
        let signature = parse_signature(signature)?;
        let recovered = signature
            .recover_address_from_msg(message.as_bytes())
            .map_err(|e| Error::InvalidArgument(format!("unrecoverable signature: {e}")))?;
        Ok(json!({
            "valid": recovered == address,
            "recovered_address": recovered.to_checksum(None),
        }))
    }

    /// Sign EIP-712 typed data.
    pub fn sign_typed_data(&self, agent_id: &str, typed_data: Value) -> Result<Value> {
        let hash = typed_data_hash(typed_data)?;
        let signature = self.sign_prehash(agent_id, hash)?;
        Ok(json!({
            "signature": format!("0x{}", hex::encode(signature.as_bytes())),
            "message_hash": hash.to_string(),
        }))
    }

    /// Check an EIP-712 signature against an address.
    pub fn verify_typed_data(
        &self,
        address: &str,
        typed_data: Value,
        signature: &str,
    ) -> Result<Value> {
        let address = parse_address(address)?;
        let signature = parse_signature(signature)?;
        let hash = typed_data_hash(typed_data)?;
        let recovered = signature
            .recover_address_from_prehash(&hash)
            .map_err(|e| Error::InvalidArgument(format!("unrecoverable signature: {e}")))?;
        Ok(json!({
            "valid": recovered == address,
            "recovered_address": recovered.to_checksum(None),
        }))
    }

    fn sign_prehash(&self, agent_id: &str, hash: B256) -> Result<Signature> {
        let signer = self.load_signer(agent_id)?;
        signer
            .sign_hash_sync(&hash)
            .map_err(|e| Error::Storage(format!("signing failed: {e}")))
    }

    /// Decrypt the stored key and build a signer, checking that the derived
    /// address still matches the record.
    fn load_signer(&self, agent_id: &str) -> Result<PrivateKeySigner> {
        let record = self.keystore.get(agent_id)?;
        let key = self.keystore.decrypt(agent_id)?;
        let signer = PrivateKeySigner::from_slice(&key).map_err(|_| Error::DecryptFailed)?;
        if signer.address() != record.address {
            return Err(Error::DecryptFailed);
        }
        Ok(signer)
    }

    /// Ask the configured faucet to fund the agent's address, then poll the
    /// balance until it rises or the timeout passes.
    pub async fn request_faucet(&self, agent_id: &str, amount: Option<&str>) -> Result<Value> {
        let faucet_url = self
            .config
            .faucet_url
            .as_deref()
            .ok_or_else(|| Error::Config("no faucet endpoint configured".into()))?;
        let record = self.keystore.get(agent_id)?;

        let mut payload = json!({ "address": record.address.to_checksum(None) });
        if let Some(amount) = amount {
            units::parse_native(amount)?;
            payload["amount"] = json!(amount);
        }

        let start_balance = self.chain.balance(record.address).await?;
        let response = self
            .http
            .post(faucet_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::ChainUnreachable(format!("faucet: {e}")))?;
        if !response.status().is_success() {
            return Ok(json!({
                "ok": false,
                "status": response.status().as_u16(),
                "balance": units::format_native(start_balance),
            }));
        }

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(60);
        let mut end_balance = start_balance;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            end_balance = self.chain.balance(record.address).await?;
            if end_balance > start_balance {
                break;
            }
        }
        Ok(json!({
            "ok": end_balance > start_balance,
            "start_balance": units::format_native(start_balance),
            "end_balance": units::format_native(end_balance),
        }))
    }
}

fn parse_signature(raw: &str) -> Result<Signature> {
    let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
        .map_err(|_| Error::InvalidArgument("signature must be hex".into()))?;
    Signature::try_from(bytes.as_slice())
        .map_err(|_| Error::InvalidArgument("signature must be 65 bytes".into()))
}

fn typed_data_hash(typed_data: Value) -> Result<B256> {
    let typed: alloy::dyn_abi::TypedData = serde_json::from_value(typed_data)
        .map_err(|e| Error::InvalidArgument(format!("invalid typed data: {e}")))?;
    typed
        .eip712_signing_hash()
        .map_err(|e| Error::InvalidArgument(format!("invalid typed data: {e}")))
}
