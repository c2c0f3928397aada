//! Tool surface
//!
//! The fixed verb set the core exposes to its transport. Each tool is a
//! named operation over a JSON argument map; every dispatch runs through
//! the policy engine (rate limit before, audit record after). The static
//! table carries the idempotency tag transports consult before retrying.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::policy::PolicyEngine;
use crate::strategy::{CreateStrategy, StrategyManager};
use crate::units;
use crate::wallet::{TransferOutcome, TransferRequest, WalletManager};
use crate::{Error, Result};

pub const TOOL_CREATE_WALLET: &str = "create_wallet";
pub const TOOL_IMPORT_WALLET_PRIVKEY: &str = "import_wallet_privkey";
pub const TOOL_IMPORT_WALLET_MNEMONIC: &str = "import_wallet_mnemonic";
pub const TOOL_IMPORT_WALLET_KEYSTORE: &str = "import_wallet_keystore";
pub const TOOL_GENERATE_MNEMONIC: &str = "generate_mnemonic";
pub const TOOL_LIST_WALLETS: &str = "list_wallets";
pub const TOOL_QUERY_BALANCE: &str = "query_balance";
pub const TOOL_PROVIDER_STATUS: &str = "provider_status";
pub const TOOL_INSPECT_CONTRACT: &str = "inspect_contract";
pub const TOOL_SIMULATE_TRANSFER: &str = "simulate_transfer";
pub const TOOL_EXECUTE_TRANSFER: &str = "execute_transfer";
pub const TOOL_SIGN_MESSAGE: &str = "sign_message";
pub const TOOL_VERIFY_MESSAGE: &str = "verify_message";
pub const TOOL_SIGN_TYPED_DATA: &str = "sign_typed_data";
pub const TOOL_VERIFY_TYPED_DATA: &str = "verify_typed_data";
pub const TOOL_EXPORT_KEYSTORE: &str = "export_keystore";
pub const TOOL_EXPORT_PRIVATE_KEY: &str = "export_private_key";
pub const TOOL_REQUEST_FAUCET: &str = "request_faucet";
pub const TOOL_CREATE_STRATEGY: &str = "create_strategy";
pub const TOOL_START_STRATEGY: &str = "start_strategy";
pub const TOOL_STOP_STRATEGY: &str = "stop_strategy";
pub const TOOL_DELETE_STRATEGY: &str = "delete_strategy";
pub const TOOL_TICK_STRATEGY: &str = "tick_strategy";
pub const TOOL_LIST_STRATEGIES: &str = "list_strategies";
pub const TOOL_STRATEGY_STATUS: &str = "strategy_status";

/// Static description of one tool.
#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    /// Safe for the transport to retry without caller consent.
    pub idempotent: bool,
}

/// The fixed tool table. `execute_transfer` and `tick_strategy` are tagged
/// non-idempotent even though some invocations degrade to read-only
/// (`dry_run`, not-due ticks): the transport cannot know in advance.
pub const TOOLS: &[ToolSpec] = &[
    ToolSpec { name: TOOL_CREATE_WALLET, idempotent: false },
    ToolSpec { name: TOOL_IMPORT_WALLET_PRIVKEY, idempotent: false },
    ToolSpec { name: TOOL_IMPORT_WALLET_MNEMONIC, idempotent: false },
    ToolSpec { name: TOOL_IMPORT_WALLET_KEYSTORE, idempotent: false },
    ToolSpec { name: TOOL_GENERATE_MNEMONIC, idempotent: true },
    ToolSpec { name: TOOL_LIST_WALLETS, idempotent: true },
    ToolSpec { name: TOOL_QUERY_BALANCE, idempotent: true },
    ToolSpec { name: TOOL_PROVIDER_STATUS, idempotent: true },
    ToolSpec { name: TOOL_INSPECT_CONTRACT, idempotent: true },
    ToolSpec { name: TOOL_SIMULATE_TRANSFER, idempotent: true },
    ToolSpec { name: TOOL_EXECUTE_TRANSFER, idempotent: false },
    ToolSpec { name: TOOL_SIGN_MESSAGE, idempotent: true },
    ToolSpec { name: TOOL_VERIFY_MESSAGE, idempotent: true },
    ToolSpec { name: TOOL_SIGN_TYPED_DATA, idempotent: true },
    ToolSpec { name: TOOL_VERIFY_TYPED_DATA, idempotent: true },
    ToolSpec { name: TOOL_EXPORT_KEYSTORE, idempotent: true },
    ToolSpec { name: TOOL_EXPORT_PRIVATE_KEY, idempotent: true },
    ToolSpec { name: TOOL_REQUEST_FAUCET, idempotent: false },
    ToolSpec { name: TOOL_CREATE_STRATEGY, idempotent: false },
    ToolSpec { name: TOOL_START_STRATEGY, idempotent: false },
    ToolSpec { name: TOOL_STOP_STRATEGY, idempotent: false },
    ToolSpec { name: TOOL_DELETE_STRATEGY, idempotent: false },
    ToolSpec { name: TOOL_TICK_STRATEGY, idempotent: false },
    ToolSpec { name: TOOL_LIST_STRATEGIES, idempotent: true },
    ToolSpec { name: TOOL_STRATEGY_STATUS, idempotent: true },
];

pub fn spec_for(name: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|spec| spec.name == name)
}

/// Pull the rate-limit principal out of an argument map.
pub fn extract_agent_id(args: &Value) -> Option<String> {
    for key in ["agent_id", "agent", "address"] {
        if let Some(value) = args.get(key).and_then(|v| v.as_str()) {
            return Some(value.to_string());
        }
    }
    None
}

/// Dispatches named tool calls through the policy engine to the managers.
pub struct ToolRouter {
    wallet: Arc<WalletManager>,
    strategies: Arc<StrategyManager>,
    policy: Arc<PolicyEngine>,
}

impl ToolRouter {
    pub fn new(
        wallet: Arc<WalletManager>,
        strategies: Arc<StrategyManager>,
        policy: Arc<PolicyEngine>,
    ) -> Self {
        Self {
            wallet,
            strategies,
            policy,
        }
    }

    pub async fn dispatch(&self, tool: &str, args: Value) -> Result<Value> {
        let spec = spec_for(tool).ok_or_else(|| Error::NotFound(tool.to_string()))?;
        let agent_id = extract_agent_id(&args);
        let now = Utc::now();

        if let Err(denied) = self.policy.enforce(spec.name, agent_id.as_deref(), now) {
            let outcome: Result<Value> = Err(denied);
            self.policy
                .record(spec.name, agent_id.as_deref(), now, &args, &outcome);
            return outcome;
        }

        let outcome = self.call(spec.name, &args).await;
        self.policy
            .record(spec.name, agent_id.as_deref(), Utc::now(), &args, &outcome);
        outcome
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<Value> {
        match tool {
            TOOL_CREATE_WALLET => {
                let agent_id = required_str(args, "agent_id")?;
                let address = self.wallet.create_wallet(agent_id).await?;
                Ok(json!({ "agent_id": agent_id, "address": address.to_checksum(None) }))
            }
            TOOL_IMPORT_WALLET_PRIVKEY => {
                let agent_id = required_str(args, "agent_id")?;
                let private_key = required_str(args, "private_key")?;
                let address = self.wallet.import_wallet_privkey(agent_id, private_key).await?;
                Ok(json!({ "agent_id": agent_id, "address": address.to_checksum(None) }))
            }
            TOOL_IMPORT_WALLET_MNEMONIC => {
                let agent_id = required_str(args, "agent_id")?;
                let mnemonic = required_str(args, "mnemonic")?;
                let address = self.wallet.import_wallet_mnemonic(agent_id, mnemonic).await?;
                Ok(json!({ "agent_id": agent_id, "address": address.to_checksum(None) }))
            }
            TOOL_IMPORT_WALLET_KEYSTORE => {
                let agent_id = required_str(args, "agent_id")?;
                let keystore_json = required_str(args, "keystore_json")?;
                let passphrase = required_str(args, "passphrase")?;
                let address = self
                    .wallet
                    .import_wallet_keystore(agent_id, keystore_json, passphrase)
                    .await?;
                Ok(json!({ "agent_id": agent_id, "address": address.to_checksum(None) }))
            }
            TOOL_GENERATE_MNEMONIC => {
                let word_count = args
                    .get("word_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(12) as usize;
                let mnemonic = self.wallet.generate_mnemonic(word_count)?;
                Ok(json!({ "mnemonic": mnemonic, "word_count": word_count }))
            }
            TOOL_LIST_WALLETS => {
                let mut map = Map::new();
                for (agent_id, address) in self.wallet.list_wallets()? {
                    map.insert(agent_id, json!(address.to_checksum(None)));
                }
                Ok(Value::Object(map))
            }
            TOOL_QUERY_BALANCE => {
                let agent_id = required_str(args, "agent_id")?;
                let balance = self.wallet.query_balance(agent_id).await?;
                Ok(json!({ "agent_id": agent_id, "balance": units::format_native(balance) }))
            }
            TOOL_PROVIDER_STATUS => self.wallet.provider_status().await,
            TOOL_INSPECT_CONTRACT => {
                let address = required_str(args, "address")?;
                self.wallet.inspect_contract(address).await
            }
            TOOL_SIMULATE_TRANSFER => {
                let agent_id = required_str(args, "agent_id")?;
                let to = required_str(args, "to")?;
                let amount = units::parse_native(required_str(args, "amount")?)?;
                let simulation = self.wallet.simulate_transfer(agent_id, to, amount).await?;
                Ok(simulation.to_json())
            }
            TOOL_EXECUTE_TRANSFER => {
                let agent_id = required_str(args, "agent_id")?;
                let to = required_str(args, "to")?;
                let amount = units::parse_native(required_str(args, "amount")?)?;
                let outcome = self
                    .wallet
                    .execute_transfer(TransferRequest {
                        agent_id,
                        to,
                        amount,
                        confirmation_code: optional_str(args, "confirmation_code"),
                        dry_run: args
                            .get("dry_run")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false),
                    })
                    .await?;
                Ok(match outcome {
                    TransferOutcome::Broadcast { tx_hash, nonce } => {
                        json!({ "tx_hash": tx_hash.to_string(), "nonce": nonce })
                    }
                    TransferOutcome::DryRun(simulation) => {
                        json!({ "dry_run": true, "simulation": simulation.to_json() })
                    }
                })
            }
            TOOL_SIGN_MESSAGE => {
                let agent_id = required_str(args, "agent_id")?;
                let message = required_str(args, "message")?;
                self.wallet.sign_message(agent_id, message)
            }
            TOOL_VERIFY_MESSAGE => {
                let address = required_str(args, "address")?;
                let message = required_str(args, "message")?;
                let signature = required_str(args, "signature")?;
                self.wallet.verify_message(address, message, signature)
            }
            TOOL_SIGN_TYPED_DATA => {
                let agent_id = required_str(args, "agent_id")?;
                let typed_data = args
                    .get("typed_data")
                    .cloned()
                    .ok_or_else(|| Error::InvalidArgument("missing 'typed_data'".into()))?;
                self.wallet.sign_typed_data(agent_id, typed_data)
            }
            TOOL_VERIFY_TYPED_DATA => {
                let address = required_str(args, "address")?;
                let signature = required_str(args, "signature")?;
                let typed_data = args
                    .get("typed_data")
                    .cloned()
                    .ok_or_else(|| Error::InvalidArgument("missing 'typed_data'".into()))?;
                self.wallet.verify_typed_data(address, typed_data, signature)
            }
            TOOL_EXPORT_KEYSTORE => {
                let agent_id = required_str(args, "agent_id")?;
                let passphrase = required_str(args, "passphrase")?;
                let keystore = self.wallet.export_keystore(agent_id, passphrase)?;
                Ok(json!({ "agent_id": agent_id, "keystore_json": keystore }))
            }
            TOOL_EXPORT_PRIVATE_KEY => {
                let agent_id = required_str(args, "agent_id")?;
                let private_key = self
                    .wallet
                    .export_private_key(agent_id, optional_str(args, "confirmation_code"))?;
                Ok(json!({ "agent_id": agent_id, "private_key": private_key }))
            }
            TOOL_REQUEST_FAUCET => {
                let agent_id = required_str(args, "agent_id")?;
                self.wallet
                    .request_faucet(agent_id, optional_str(args, "amount"))
                    .await
            }
            TOOL_CREATE_STRATEGY => {
                let daily_cap = match optional_str(args, "daily_cap") {
                    Some(cap) => Some(units::parse_native(cap)?),
                    None => None,
                };
                self.strategies.create(CreateStrategy {
                    label: required_str(args, "label")?.to_string(),
                    agent_id: required_str(args, "agent_id")?.to_string(),
                    to_address: required_str(args, "to_address")?.to_string(),
                    amount: units::parse_native(required_str(args, "amount")?)?,
                    interval_seconds: args
                        .get("interval_seconds")
                        .and_then(|v| v.as_u64())
                        .ok_or_else(|| {
                            Error::InvalidArgument("missing 'interval_seconds'".into())
                        })?,
                    max_base_fee_gwei: args.get("max_base_fee_gwei").and_then(|v| v.as_u64()),
                    daily_cap,
                    confirmation_code: optional_str(args, "confirmation_code")
                        .map(|s| s.to_string()),
                })
            }
            TOOL_START_STRATEGY => {
                let label = required_str(args, "label")?;
                self.strategies.start(label, Utc::now())
            }
            TOOL_STOP_STRATEGY => self.strategies.stop(required_str(args, "label")?),
            TOOL_DELETE_STRATEGY => self.strategies.delete(required_str(args, "label")?),
            TOOL_TICK_STRATEGY => {
                let label = required_str(args, "label")?;
                let report = self.strategies.tick(label, Utc::now()).await?;
                Ok(report.to_json())
            }
            TOOL_LIST_STRATEGIES => self.strategies.list(),
            TOOL_STRATEGY_STATUS => self.strategies.status(required_str(args, "label")?),
            other => Err(Error::NotFound(other.to_string())),
        }
    }

    /// Tick every enabled strategy once. Used by the scheduler loop.
    pub async fn tick_all(&self) -> Result<Vec<Value>> {
        let strategies = self.strategies.list()?;
        let mut reports = Vec::new();
        let Value::Array(entries) = strategies else {
            return Ok(reports);
        };
        for entry in entries {
            let Some(label) = entry.get("label").and_then(|v| v.as_str()) else {
                continue;
            };
            if entry.get("enabled") != Some(&json!(true)) {
                continue;
            }
            match self.dispatch(TOOL_TICK_STRATEGY, json!({ "label": label })).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::warn!(label = label, error = %e, "tick failed");
                    reports.push(json!({ "label": label, "outcome": "failed", "error_kind": e.kind() }));
                }
            }
        }
        Ok(reports)
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidArgument(format!("missing '{key}'")))
}

fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitOverride, RateLimitRule, RateLimits};
    use crate::test_support::{router_fixture, router_with_limits, DEST};
    use crate::config::Config;

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let (router, _mock) = router_fixture(Config::default()).await;
        let err = router.dispatch("open_pod_bay_doors", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn create_then_list_round_trip() {
        let (router, _mock) = router_fixture(Config::default()).await;

        let created = router
            .dispatch(TOOL_CREATE_WALLET, json!({"agent_id": "a1"}))
            .await
            .unwrap();
        let address = created["address"].as_str().unwrap().to_string();

        let listed = router.dispatch(TOOL_LIST_WALLETS, json!({})).await.unwrap();
        assert_eq!(listed["a1"], json!(address));

        let err = router
            .dispatch(TOOL_CREATE_WALLET, json!({"agent_id": "a1"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "agent_exists");
    }

    #[tokio::test]
    async fn rate_limit_denies_third_transfer_without_broadcast() {
        let limits = RateLimits::new(
            RateLimitRule { max_calls: 1000, window_seconds: 60 },
            vec![RateLimitOverride {
                tool: TOOL_EXECUTE_TRANSFER.into(),
                agent_id: None,
                max_calls: 2,
                window_seconds: 60,
            }],
        );
        let (router, mock) = router_with_limits(limits).await;

        let created = router
            .dispatch(TOOL_CREATE_WALLET, json!({"agent_id": "a1"}))
            .await
            .unwrap();
        let address: alloy::primitives::Address =
            created["address"].as_str().unwrap().parse().unwrap();
        mock.set_balance(address, crate::units::parse_native("1").unwrap());

        let transfer = json!({"agent_id": "a1", "to": DEST, "amount": "0.1"});
        router
            .dispatch(TOOL_EXECUTE_TRANSFER, transfer.clone())
            .await
            .unwrap();
        router
            .dispatch(TOOL_EXECUTE_TRANSFER, transfer.clone())
            .await
            .unwrap();

        let err = router
            .dispatch(TOOL_EXECUTE_TRANSFER, transfer)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
        assert_eq!(mock.broadcast_nonces(), vec![0, 1]);
    }

    #[tokio::test]
    async fn dry_run_transfer_degrades_to_read_only() {
        let (router, mock) = router_fixture(Config::default()).await;
        let created = router
            .dispatch(TOOL_CREATE_WALLET, json!({"agent_id": "a1"}))
            .await
            .unwrap();
        let address: alloy::primitives::Address =
            created["address"].as_str().unwrap().parse().unwrap();
        mock.set_balance(address, crate::units::parse_native("1").unwrap());

        let result = router
            .dispatch(
                TOOL_EXECUTE_TRANSFER,
                json!({"agent_id": "a1", "to": DEST, "amount": "0.1", "dry_run": true}),
            )
            .await
            .unwrap();
        assert_eq!(result["dry_run"], json!(true));
        assert_eq!(result["simulation"]["sufficient_balance"], json!(true));
        assert!(mock.broadcast_nonces().is_empty());
    }

    #[tokio::test]
    async fn every_dispatch_is_journaled_with_redaction() {
        let (router, _mock) = router_fixture(Config::default()).await;
        router
            .dispatch(
                TOOL_IMPORT_WALLET_PRIVKEY,
                json!({
                    "agent_id": "a1",
                    "private_key": crate::test_support::TEST_KEY
                }),
            )
            .await
            .unwrap();

        // Failed lookups are journaled too
        router
            .dispatch(TOOL_QUERY_BALANCE, json!({"agent_id": "ghost"}))
            .await
            .unwrap_err();

        let events = router.policy.journal().recent(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tool_name, TOOL_QUERY_BALANCE);
        assert_eq!(events[0].status, "error");
        assert_eq!(events[0].error_kind.as_deref(), Some("not_found"));
        assert_eq!(events[1].tool_name, TOOL_IMPORT_WALLET_PRIVKEY);
        assert_eq!(events[1].status, "ok");
        let digest = events[1].request_digest.as_deref().unwrap();
        assert!(!digest.contains("ac0974bec"));
    }

    #[tokio::test]
    async fn strategy_tools_flow_through_the_router() {
        let (router, mock) = router_fixture(Config::default()).await;
        let created = router
            .dispatch(TOOL_CREATE_WALLET, json!({"agent_id": "a1"}))
            .await
            .unwrap();
        let address: alloy::primitives::Address =
            created["address"].as_str().unwrap().parse().unwrap();
        mock.set_balance(address, crate::units::parse_native("1").unwrap());

        router
            .dispatch(
                TOOL_CREATE_STRATEGY,
                json!({
                    "label": "daily",
                    "agent_id": "a1",
                    "to_address": DEST,
                    "amount": "0.01",
                    "interval_seconds": 1
                }),
            )
            .await
            .unwrap();
        router
            .dispatch(TOOL_START_STRATEGY, json!({"label": "daily"}))
            .await
            .unwrap();

        let report = router
            .dispatch(TOOL_TICK_STRATEGY, json!({"label": "daily"}))
            .await
            .unwrap();
        assert_eq!(report["outcome"], json!("sent"));
        assert_eq!(mock.broadcast_nonces().len(), 1);

        let status = router
            .dispatch(TOOL_STRATEGY_STATUS, json!({"label": "daily"}))
            .await
            .unwrap();
        assert_eq!(status["last_tx_hash"], report["tx_hash"]);
    }

    #[test]
    fn side_effect_tags_match_the_contract() {
        let non_idempotent = [
            TOOL_CREATE_WALLET,
            TOOL_IMPORT_WALLET_PRIVKEY,
            TOOL_IMPORT_WALLET_MNEMONIC,
            TOOL_IMPORT_WALLET_KEYSTORE,
            TOOL_EXECUTE_TRANSFER,
            TOOL_TICK_STRATEGY,
            TOOL_CREATE_STRATEGY,
            TOOL_START_STRATEGY,
            TOOL_STOP_STRATEGY,
            TOOL_DELETE_STRATEGY,
            TOOL_REQUEST_FAUCET,
        ];
        for spec in TOOLS {
            assert_eq!(
                !spec.idempotent,
                non_idempotent.contains(&spec.name),
                "unexpected tag for {}",
                spec.name
            );
        }
    }

    #[test]
    fn agent_extraction_prefers_agent_id() {
        assert_eq!(
            extract_agent_id(&json!({"agent_id": "a1", "address": "0x1"})),
            Some("a1".to_string())
        );
        assert_eq!(
            extract_agent_id(&json!({"address": "0x1"})),
            Some("0x1".to_string())
        );
        assert_eq!(extract_agent_id(&json!({"label": "daily"})), None);
    }
}
