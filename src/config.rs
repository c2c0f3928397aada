//! Process configuration
//!
//! All deployment inputs are read from the environment exactly once, at
//! startup, into an immutable [`Config`] that is passed into each component's
//! constructor. No component reads the environment after that.
//!
//! # Examples
//!
//! ```bash
//! # Ordered RPC endpoints, first is preferred
//! export AGENTVAULT_RPC_URLS="https://rpc-a.example,https://rpc-b.example"
//!
//! # 32-byte hex encryption secret; omit to use a generated sidecar file
//! export AGENTVAULT_ENCRYPT_KEY="6f1d...c2"
//!
//! # Transfers above 1.0 native units require the confirmation code
//! export AGENTVAULT_MAX_TX="1.0"
//! export AGENTVAULT_TX_CONFIRM_CODE="OK-42"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use alloy::primitives::U256;
use serde::Deserialize;

use crate::units;
use crate::{Error, Result};

/// Default public test-network endpoint, used when nothing is configured.
const DEFAULT_RPC_URL: &str = "https://ethereum-sepolia.publicnode.com";
const DEFAULT_DB_PATH: &str = "agentvault.db";
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 15;
const DEFAULT_RECEIPT_TIMEOUT_SECS: u64 = 120;
/// Default priority-tip percentile over recent blocks. Stable per release;
/// override with `AGENTVAULT_FEE_TIP_PERCENTILE`.
const DEFAULT_FEE_TIP_PERCENTILE: f64 = 50.0;
/// Default fee-history lookback in blocks.
const DEFAULT_FEE_HISTORY_BLOCKS: u64 = 10;
const DEFAULT_RATE_LIMIT_CALLS: u32 = 120;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Environment variable names.
mod env_vars {
    pub const RPC_URLS: &str = "AGENTVAULT_RPC_URLS";
    pub const ENCRYPT_KEY: &str = "AGENTVAULT_ENCRYPT_KEY";
    pub const DATABASE_PATH: &str = "AGENTVAULT_DB";
    pub const MAX_TX: &str = "AGENTVAULT_MAX_TX";
    pub const TX_CONFIRM_CODE: &str = "AGENTVAULT_TX_CONFIRM_CODE";
    pub const ALLOW_PLAINTEXT_EXPORT: &str = "AGENTVAULT_ALLOW_PLAINTEXT_EXPORT";
    pub const EXPORT_CODE: &str = "AGENTVAULT_EXPORT_CODE";
    pub const RATE_LIMITS: &str = "AGENTVAULT_RATE_LIMITS";
    pub const FAUCET_URL: &str = "AGENTVAULT_FAUCET_URL";
    pub const CALL_TIMEOUT_SECS: &str = "AGENTVAULT_CALL_TIMEOUT_SECS";
    pub const RECEIPT_TIMEOUT_SECS: &str = "AGENTVAULT_RECEIPT_TIMEOUT_SECS";
    pub const FEE_TIP_PERCENTILE: &str = "AGENTVAULT_FEE_TIP_PERCENTILE";
    pub const FEE_HISTORY_BLOCKS: &str = "AGENTVAULT_FEE_HISTORY_BLOCKS";
}

/// A single rate-limit rule: at most `max_calls` within `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitRule {
    pub max_calls: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            max_calls: DEFAULT_RATE_LIMIT_CALLS,
            window_seconds: DEFAULT_RATE_LIMIT_WINDOW_SECS,
        }
    }
}

/// One override entry in the rate-limit rule set.
///
/// `agent_id = None` applies to the tool for all agents; a set `agent_id`
/// applies to that (tool, agent) pair only and wins over the tool-wide rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitOverride {
    pub tool: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub max_calls: u32,
    pub window_seconds: u64,
}

/// Layered rate-limit configuration: default -> per-tool -> per-(tool, agent).
#[derive(Debug, Clone, Default)]
pub struct RateLimits {
    pub default: RateLimitRule,
    per_tool: HashMap<String, RateLimitRule>,
    per_agent: HashMap<(String, String), RateLimitRule>,
}

impl RateLimits {
    pub fn new(default: RateLimitRule, overrides: Vec<RateLimitOverride>) -> Self {
        let mut per_tool = HashMap::new();
        let mut per_agent = HashMap::new();
        for o in overrides {
            let rule = RateLimitRule {
                max_calls: o.max_calls,
                window_seconds: o.window_seconds,
            };
            match o.agent_id {
                Some(agent) => {
                    per_agent.insert((o.tool, agent), rule);
                }
                None => {
                    per_tool.insert(o.tool, rule);
                }
            }
        }
        Self {
            default,
            per_tool,
            per_agent,
        }
    }

    /// Most specific rule wins: (tool, agent) -> tool -> default.
    pub fn rule_for(&self, tool: &str, agent_id: Option<&str>) -> RateLimitRule {
        if let Some(agent) = agent_id {
            if let Some(rule) = self.per_agent.get(&(tool.to_string(), agent.to_string())) {
                return *rule;
            }
        }
        if let Some(rule) = self.per_tool.get(tool) {
            return *rule;
        }
        self.default
    }

    fn from_json(raw: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct RateLimitFile {
            #[serde(default)]
            default: Option<RateLimitRule>,
            #[serde(default)]
            overrides: Vec<RateLimitOverride>,
        }
        let parsed: RateLimitFile = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid rate-limit rules: {e}")))?;
        Ok(Self::new(parsed.default.unwrap_or_default(), parsed.overrides))
    }
}

/// Immutable process-wide configuration.
#[derive(Clone)]
pub struct Config {
    /// Ordered RPC endpoint list; the chain client rotates through these on
    /// transport failure.
    pub rpc_urls: Vec<String>,
    /// Per-call timeout for every chain operation.
    pub chain_call_timeout: Duration,
    /// Deadline for receipt polling after a broadcast.
    pub receipt_timeout: Duration,
    /// Hex-encoded 32-byte encryption secret. When absent, a sidecar secret
    /// file next to the database is generated on first start.
    pub encryption_secret: Option<String>,
    /// SQLite database location.
    pub database_path: PathBuf,
    /// Spend threshold in wei; transfers above it require the confirmation
    /// code. `None` disables the gate.
    pub spend_threshold_wei: Option<U256>,
    /// Deployment secret compared against caller-supplied confirmation codes.
    pub confirmation_code: Option<String>,
    /// First of the two plaintext-export gates.
    pub allow_plaintext_export: bool,
    /// Second gate: the code callers must supply for plaintext export.
    pub export_code: Option<String>,
    /// Rate-limit rule set for the policy engine.
    pub rate_limits: RateLimits,
    /// Optional faucet endpoint for the test-network helper.
    pub faucet_url: Option<String>,
    /// Percentile of recent-block priority fees used as the tip suggestion.
    pub fee_tip_percentile: f64,
    /// How many recent blocks the fee suggestion samples.
    pub fee_history_blocks: u64,
}

impl Config {
    /// Build the configuration from the environment.
    ///
    /// Call once at startup, before constructing any component.
    pub fn from_env() -> Result<Self> {
        let rpc_urls = match std::env::var(env_vars::RPC_URLS) {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => {
                tracing::warn!("no RPC endpoints configured, using public default");
                vec![DEFAULT_RPC_URL.to_string()]
            }
        };

        let spend_threshold_wei = match std::env::var(env_vars::MAX_TX) {
            Ok(raw) => Some(units::parse_native(&raw).map_err(|_| {
                Error::Config(format!("{} must be a decimal amount", env_vars::MAX_TX))
            })?),
            Err(_) => None,
        };

        let rate_limits = match std::env::var(env_vars::RATE_LIMITS) {
            Ok(raw) => RateLimits::from_json(&raw)?,
            Err(_) => RateLimits::default(),
        };

        Ok(Self {
            rpc_urls,
            chain_call_timeout: Duration::from_secs(parse_env_u64(
                env_vars::CALL_TIMEOUT_SECS,
                DEFAULT_CALL_TIMEOUT_SECS,
            )?),
            receipt_timeout: Duration::from_secs(parse_env_u64(
                env_vars::RECEIPT_TIMEOUT_SECS,
                DEFAULT_RECEIPT_TIMEOUT_SECS,
            )?),
            encryption_secret: std::env::var(env_vars::ENCRYPT_KEY).ok(),
            database_path: std::env::var(env_vars::DATABASE_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH)),
            spend_threshold_wei,
            confirmation_code: std::env::var(env_vars::TX_CONFIRM_CODE).ok(),
            allow_plaintext_export: std::env::var(env_vars::ALLOW_PLAINTEXT_EXPORT)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            export_code: std::env::var(env_vars::EXPORT_CODE).ok(),
            rate_limits,
            faucet_url: std::env::var(env_vars::FAUCET_URL).ok(),
            fee_tip_percentile: parse_env_f64(
                env_vars::FEE_TIP_PERCENTILE,
                DEFAULT_FEE_TIP_PERCENTILE,
            )?,
            fee_history_blocks: parse_env_u64(
                env_vars::FEE_HISTORY_BLOCKS,
                DEFAULT_FEE_HISTORY_BLOCKS,
            )?,
        })
    }

    /// Path of the sidecar secret file derived from the database location.
    pub fn sidecar_secret_path(&self) -> PathBuf {
        self.database_path.with_extension("key")
    }
}

fn parse_env_u64(var: &str, default: u64) -> Result<u64> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{var} must be an integer"))),
        Err(_) => Ok(default),
    }
}

fn parse_env_f64(var: &str, default: f64) -> Result<f64> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{var} must be a number"))),
        Err(_) => Ok(default),
    }
}

// Manual Debug so secrets never reach logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("rpc_urls", &self.rpc_urls)
            .field("database_path", &self.database_path)
            .field("spend_threshold_wei", &self.spend_threshold_wei)
            .field("allow_plaintext_export", &self.allow_plaintext_export)
            .field("faucet_url", &self.faucet_url)
            .field("fee_tip_percentile", &self.fee_tip_percentile)
            .field("fee_history_blocks", &self.fee_history_blocks)
            .field("encryption_secret", &"[REDACTED]")
            .field("confirmation_code", &"[REDACTED]")
            .field("export_code", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_urls: vec![DEFAULT_RPC_URL.to_string()],
            chain_call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            receipt_timeout: Duration::from_secs(DEFAULT_RECEIPT_TIMEOUT_SECS),
            encryption_secret: None,
            database_path: PathBuf::from(DEFAULT_DB_PATH),
            spend_threshold_wei: None,
            confirmation_code: None,
            allow_plaintext_export: false,
            export_code: None,
            rate_limits: RateLimits::default(),
            faucet_url: None,
            fee_tip_percentile: DEFAULT_FEE_TIP_PERCENTILE,
            fee_history_blocks: DEFAULT_FEE_HISTORY_BLOCKS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_specific_rate_rule_wins() {
        let limits = RateLimits::new(
            RateLimitRule {
                max_calls: 100,
                window_seconds: 60,
            },
            vec![
                RateLimitOverride {
                    tool: "execute_transfer".into(),
                    agent_id: None,
                    max_calls: 10,
                    window_seconds: 60,
                },
                RateLimitOverride {
                    tool: "execute_transfer".into(),
                    agent_id: Some("a1".into()),
                    max_calls: 2,
                    window_seconds: 60,
                },
            ],
        );

        assert_eq!(limits.rule_for("query_balance", Some("a1")).max_calls, 100);
        assert_eq!(limits.rule_for("execute_transfer", None).max_calls, 10);
        assert_eq!(
            limits.rule_for("execute_transfer", Some("a2")).max_calls,
            10
        );
        assert_eq!(limits.rule_for("execute_transfer", Some("a1")).max_calls, 2);
    }

    #[test]
    fn rate_rules_parse_from_json() {
        let limits = RateLimits::from_json(
            r#"{
                "default": {"max_calls": 60, "window_seconds": 30},
                "overrides": [
                    {"tool": "execute_transfer", "max_calls": 2, "window_seconds": 60}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(limits.default.max_calls, 60);
        assert_eq!(limits.rule_for("execute_transfer", None).max_calls, 2);

        assert!(RateLimits::from_json("not json").is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = Config {
            encryption_secret: Some("deadbeef".into()),
            confirmation_code: Some("OK-42".into()),
            ..Config::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("deadbeef"));
        assert!(!debug.contains("OK-42"));
        assert!(debug.contains("[REDACTED]"));
    }
}
