//! Strategy manager
//!
//! Persistent recurring transfers with a `tick` state machine. A tick is a
//! pure state transition plus at most one transfer: it either sends, skips
//! with a reason, or does nothing because the strategy is not due. Skips and
//! sends append a run record that commits atomically with the updated
//! strategy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use alloy::primitives::U256;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use crate::chain::ChainClient;
use crate::store::strategies::{RunOutcome, RunRecord, StrategyKind, StrategyRecord, StrategyStore};
use crate::units;
use crate::wallet::{TransferOutcome, TransferRequest, WalletManager};
use crate::{Error, Result};

/// Arguments to [`StrategyManager::create`].
#[derive(Debug, Clone)]
pub struct CreateStrategy {
    pub label: String,
    pub agent_id: String,
    pub to_address: String,
    /// Amount per run, in wei.
    pub amount: U256,
    pub interval_seconds: u64,
    pub max_base_fee_gwei: Option<u64>,
    /// Daily cap in wei; `None` disables the cap.
    pub daily_cap: Option<U256>,
    /// Supplied to the wallet when a run crosses the spend threshold.
    pub confirmation_code: Option<String>,
}

/// Result of one tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub label: String,
    pub outcome: RunOutcome,
    pub tx_hash: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl TickReport {
    pub fn to_json(&self) -> Value {
        json!({
            "label": self.label,
            "outcome": self.outcome.as_str(),
            "tx_hash": self.tx_hash,
            "next_run_at": self.next_run_at.map(|t| t.to_rfc3339()),
        })
    }
}

pub struct StrategyManager {
    store: StrategyStore,
    wallet: Arc<WalletManager>,
    chain: Arc<dyn ChainClient>,
    /// Per-label tick serialization, same shape as the wallet's per-address
    /// tokens.
    tick_locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StrategyManager {
    pub fn new(store: StrategyStore, wallet: Arc<WalletManager>, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            store,
            wallet,
            chain,
            tick_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Create a strategy in the disabled state.
    pub fn create(&self, params: CreateStrategy) -> Result<Value> {
        // The label references a wallet for its whole lifetime
        self.wallet.wallet_address(&params.agent_id)?;
        let to_address = crate::wallet::parse_address(&params.to_address)?;
        if params.amount.is_zero() {
            return Err(Error::InvalidArgument("amount must be positive".into()));
        }
        if params.interval_seconds == 0 {
            return Err(Error::InvalidArgument("interval must be positive".into()));
        }

        let now = Utc::now();
        let record = StrategyRecord {
            label: params.label,
            agent_id: params.agent_id,
            kind: StrategyKind::RecurringTransfer,
            to_address,
            amount_wei: params.amount,
            interval_seconds: params.interval_seconds,
            enabled: false,
            max_base_fee_gwei: params.max_base_fee_gwei,
            daily_cap_wei: params.daily_cap,
            next_run_at: None,
            last_run_at: None,
            last_tx_hash: None,
            spent_day: None,
            spent_today_wei: U256::ZERO,
            confirmation_code: params.confirmation_code,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&record)?;
        tracing::info!(label = %record.label, agent_id = %record.agent_id, "strategy created");
        Ok(status_json(&record))
    }

    /// Enable and schedule the first run at `now`.
    pub fn start(&self, label: &str, now: DateTime<Utc>) -> Result<Value> {
        let mut record = self.store.get(label)?;
        if record.enabled {
            return Err(Error::StrategyBadState(label.to_string()));
        }
        record.enabled = true;
        record.next_run_at = Some(now);
        record.updated_at = now;
        self.store.update(&record)?;
        tracing::info!(label = label, "strategy started");
        Ok(status_json(&record))
    }

    /// Disable and clear the schedule.
    pub fn stop(&self, label: &str) -> Result<Value> {
        let mut record = self.store.get(label)?;
        if !record.enabled {
            return Err(Error::StrategyBadState(label.to_string()));
        }
        record.enabled = false;
        record.next_run_at = None;
        record.updated_at = Utc::now();
        self.store.update(&record)?;
        tracing::info!(label = label, "strategy stopped");
        Ok(status_json(&record))
    }

    /// Remove the strategy in any state. Run records remain.
    pub fn delete(&self, label: &str) -> Result<Value> {
        self.store.delete(label)?;
        tracing::info!(label = label, "strategy deleted");
        Ok(json!({ "deleted": label }))
    }

    pub fn status(&self, label: &str) -> Result<Value> {
        let record = self.store.get(label)?;
        let runs: Vec<Value> = self
            .store
            .runs(label, 10)?
            .into_iter()
            .map(|run| {
                json!({
                    "ran_at": run.ran_at.to_rfc3339(),
                    "outcome": run.outcome.as_str(),
                    "tx_hash": run.tx_hash,
                    "detail": run.detail,
                })
            })
            .collect();
        let mut out = status_json(&record);
        out["recent_runs"] = json!(runs);
        Ok(out)
    }

    pub fn list(&self) -> Result<Value> {
        let records = self.store.list()?;
        Ok(Value::Array(records.iter().map(status_json).collect()))
    }

    /// Evaluate the strategy at `now`, emitting at most one transfer.
    pub async fn tick(&self, label: &str, now: DateTime<Utc>) -> Result<TickReport> {
        let lock = self.tick_lock(label);
        let _guard = lock.lock().await;

        let mut record = self.store.get(label)?;
        if !record.enabled {
            return Ok(TickReport {
                label: label.to_string(),
                outcome: RunOutcome::SkippedNotDue,
                tx_hash: None,
                next_run_at: record.next_run_at,
            });
        }

        let due_at = record.next_run_at.unwrap_or(now);
        if now < due_at {
            return Ok(TickReport {
                label: label.to_string(),
                outcome: RunOutcome::SkippedNotDue,
                tx_hash: None,
                next_run_at: record.next_run_at,
            });
        }

        // New UTC day resets the spent counter
        let today = now.date_naive();
        if record.spent_day != Some(today) {
            record.spent_day = Some(today);
            record.spent_today_wei = U256::ZERO;
        }

        // Missed intervals collapse into one future boundary; a tick never
        // fires a burst after downtime.
        let next_run_at = advance_schedule(due_at, record.interval_seconds, now);

        if let Some(cap) = record.daily_cap_wei {
            let would_spend = record.spent_today_wei.saturating_add(record.amount_wei);
            if would_spend > cap {
                let detail = json!({
                    "spent_today": units::format_native(record.spent_today_wei),
                    "daily_cap": units::format_native(cap),
                });
                return self.settle(record, now, next_run_at, RunOutcome::SkippedCap, None, detail);
            }
        }

        if let Some(max_gwei) = record.max_base_fee_gwei {
            let base_fee = self.chain.status().await?.base_fee_per_gas;
            let base_fee_gwei = units::wei_to_gwei(base_fee);
            if base_fee_gwei > max_gwei as u128 {
                return self.settle(record, now, next_run_at, RunOutcome::SkippedGas, None, json!({
                    "base_fee_gwei": base_fee_gwei.to_string(),
                    "max_base_fee_gwei": max_gwei.to_string(),
                }));
            }
        }

        let to = record.to_address.to_checksum(None);
        let simulation = self
            .wallet
            .simulate_transfer(&record.agent_id, &to, record.amount_wei)
            .await?;
        if !simulation.sufficient_balance {
            return self.settle(
                record,
                now,
                next_run_at,
                RunOutcome::SkippedSimulation,
                None,
                simulation.to_json(),
            );
        }

        let transfer = self
            .wallet
            .execute_transfer(TransferRequest {
                agent_id: &record.agent_id,
                to: &to,
                amount: record.amount_wei,
                confirmation_code: record.confirmation_code.as_deref(),
                dry_run: false,
            })
            .await;

        match transfer {
            Ok(TransferOutcome::Broadcast { tx_hash, nonce }) => {
                let tx_hash = tx_hash.to_string();
                record.last_run_at = Some(now);
                record.last_tx_hash = Some(tx_hash.clone());
                record.spent_today_wei = record.spent_today_wei.saturating_add(record.amount_wei);
                self.settle(
                    record,
                    now,
                    next_run_at,
                    RunOutcome::Sent,
                    Some(tx_hash),
                    json!({ "nonce": nonce }),
                )
            }
            Ok(TransferOutcome::DryRun(_)) => {
                // execute_transfer was called with dry_run = false
                Err(Error::Storage("unexpected dry-run outcome".into()))
            }
            Err(e) => {
                let report = self.settle(
                    record,
                    now,
                    next_run_at,
                    RunOutcome::Failed,
                    None,
                    json!({ "error_kind": e.kind() }),
                );
                if let Err(persist) = report {
                    tracing::error!(label = label, error = %persist, "failed to persist failed run");
                }
                Err(e)
            }
        }
    }

    /// Persist the tick decision: updated strategy plus its run record, one
    /// transaction.
    fn settle(
        &self,
        mut record: StrategyRecord,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        outcome: RunOutcome,
        tx_hash: Option<String>,
        detail: Value,
    ) -> Result<TickReport> {
        record.next_run_at = Some(next_run_at);
        record.updated_at = now;
        let run = RunRecord {
            strategy_label: record.label.clone(),
            ran_at: now,
            outcome,
            tx_hash: tx_hash.clone(),
            detail: Some(detail),
        };
        self.store.update_with_run(&record, &run)?;
        tracing::info!(
            label = %record.label,
            outcome = outcome.as_str(),
            next_run_at = %next_run_at.to_rfc3339(),
            "tick settled"
        );
        Ok(TickReport {
            label: record.label,
            outcome,
            tx_hash,
            next_run_at: Some(next_run_at),
        })
    }

    fn tick_lock(&self, label: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.tick_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Smallest schedule boundary strictly after `now`, stepping from `due_at`
/// in whole intervals.
fn advance_schedule(due_at: DateTime<Utc>, interval_seconds: u64, now: DateTime<Utc>) -> DateTime<Utc> {
    let step = Duration::seconds(interval_seconds.max(1) as i64);
    let mut next = due_at + step;
    while next <= now {
        next += step;
    }
    next
}

/// Wire shape of a strategy. Decimal strings for amounts; the confirmation
/// code never appears.
fn status_json(record: &StrategyRecord) -> Value {
    json!({
        "label": record.label,
        "agent_id": record.agent_id,
        "kind": record.kind.as_str(),
        "to_address": record.to_address.to_checksum(None),
        "amount": units::format_native(record.amount_wei),
        "interval_seconds": record.interval_seconds,
        "enabled": record.enabled,
        "max_base_fee_gwei": record.max_base_fee_gwei,
        "daily_cap": record.daily_cap_wei.map(units::format_native),
        "next_run_at": record.next_run_at.map(|t| t.to_rfc3339()),
        "last_run_at": record.last_run_at.map(|t| t.to_rfc3339()),
        "last_tx_hash": record.last_tx_hash,
        "spent_day": record.spent_day.map(|d| d.format("%Y-%m-%d").to_string()),
        "spent_today": units::format_native(record.spent_today_wei),
    })
}
