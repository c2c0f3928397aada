//! Strategy persistence
//!
//! Strategy records and their append-only run records. A strategy update and
//! the run record describing it commit in one transaction: after a crash the
//! store either shows both or neither.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension};

use super::Db;
use crate::units;
use crate::{Error, Result};

/// Strategy kind tag. One variant today; the tag is persisted so new kinds
/// can be added without a schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    RecurringTransfer,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::RecurringTransfer => "recurring_transfer",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "recurring_transfer" => Ok(StrategyKind::RecurringTransfer),
            other => Err(Error::Storage(format!("unknown strategy kind '{other}'"))),
        }
    }
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Sent,
    SkippedGas,
    SkippedCap,
    SkippedNotDue,
    SkippedSimulation,
    Failed,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Sent => "sent",
            RunOutcome::SkippedGas => "skipped_gas",
            RunOutcome::SkippedCap => "skipped_cap",
            RunOutcome::SkippedNotDue => "skipped_not_due",
            RunOutcome::SkippedSimulation => "skipped_simulation",
            RunOutcome::Failed => "failed",
        }
    }
}

/// One strategy record, as persisted.
#[derive(Debug, Clone)]
pub struct StrategyRecord {
    pub label: String,
    pub agent_id: String,
    pub kind: StrategyKind,
    pub to_address: Address,
    pub amount_wei: U256,
    pub interval_seconds: u64,
    pub enabled: bool,
    pub max_base_fee_gwei: Option<u64>,
    pub daily_cap_wei: Option<U256>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_tx_hash: Option<String>,
    pub spent_day: Option<NaiveDate>,
    pub spent_today_wei: U256,
    pub confirmation_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One run record, appended per tick decision.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub strategy_label: String,
    pub ran_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub tx_hash: Option<String>,
    pub detail: Option<serde_json::Value>,
}

/// Owner of the `strategies` and `strategy_runs` tables.
#[derive(Clone)]
pub struct StrategyStore {
    db: Db,
}

impl StrategyStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a fresh record. The label must be globally unique.
    pub fn insert(&self, record: &StrategyRecord) -> Result<()> {
        self.db.with_tx(|tx| {
            let taken: Option<String> = tx
                .query_row(
                    "SELECT label FROM strategies WHERE label = ?1",
                    params![record.label],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Err(Error::StrategyBadState(record.label.clone()));
            }
            tx.execute(
                "INSERT INTO strategies
                 (label, agent_id, kind, to_address, amount_wei, interval_seconds, enabled,
                  max_base_fee_gwei, daily_cap_wei, next_run_at, last_run_at, last_tx_hash,
                  spent_day, spent_today_wei, confirmation_code, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params_from_iter(record_values(record)),
            )?;
            Ok(())
        })
    }

    pub fn get(&self, label: &str) -> Result<StrategyRecord> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM strategies WHERE label = ?1"),
                params![label],
                row_to_record,
            )
            .optional()?
            .ok_or_else(|| Error::StrategyNotFound(label.to_string()))
        })
    }

    pub fn list(&self) -> Result<Vec<StrategyRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM strategies ORDER BY label"))?;
            let rows = stmt.query_map([], row_to_record)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Persist schedule/state changes without a run record (start, stop).
    pub fn update(&self, record: &StrategyRecord) -> Result<()> {
        self.db.with_tx(|tx| update_in_tx(tx, record))
    }

    /// Persist a tick result: the updated strategy and its run record commit
    /// together or not at all.
    pub fn update_with_run(&self, record: &StrategyRecord, run: &RunRecord) -> Result<()> {
        self.db.with_tx(|tx| {
            update_in_tx(tx, record)?;
            tx.execute(
                "INSERT INTO strategy_runs (strategy_label, ran_at, outcome, tx_hash, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.strategy_label,
                    run.ran_at.timestamp_millis(),
                    run.outcome.as_str(),
                    run.tx_hash,
                    run.detail.as_ref().map(|d| d.to_string()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete(&self, label: &str) -> Result<()> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM strategies WHERE label = ?1", params![label])?)
        })?;
        if deleted == 0 {
            return Err(Error::StrategyNotFound(label.to_string()));
        }
        Ok(())
    }

    /// Newest-first run history for a strategy.
    pub fn runs(&self, label: &str, limit: u32) -> Result<Vec<RunRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT strategy_label, ran_at, outcome, tx_hash, detail
                 FROM strategy_runs WHERE strategy_label = ?1
                 ORDER BY ran_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![label, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (strategy_label, ran_at, outcome, tx_hash, detail) = row?;
                out.push(RunRecord {
                    strategy_label,
                    ran_at: DateTime::from_timestamp_millis(ran_at).unwrap_or_default(),
                    outcome: parse_outcome(&outcome)?,
                    tx_hash,
                    detail: detail.map(|d| serde_json::from_str(&d).unwrap_or_default()),
                });
            }
            Ok(out)
        })
    }
}

const COLUMNS: &str = "label, agent_id, kind, to_address, amount_wei, interval_seconds, enabled,
    max_base_fee_gwei, daily_cap_wei, next_run_at, last_run_at, last_tx_hash,
    spent_day, spent_today_wei, confirmation_code, created_at, updated_at";

fn update_in_tx(tx: &rusqlite::Transaction, record: &StrategyRecord) -> Result<()> {
    let updated = tx.execute(
        "UPDATE strategies SET
             agent_id = ?2, kind = ?3, to_address = ?4, amount_wei = ?5,
             interval_seconds = ?6, enabled = ?7, max_base_fee_gwei = ?8,
             daily_cap_wei = ?9, next_run_at = ?10, last_run_at = ?11,
             last_tx_hash = ?12, spent_day = ?13, spent_today_wei = ?14,
             confirmation_code = ?15, created_at = ?16, updated_at = ?17
         WHERE label = ?1",
        params_from_iter(record_values(record)),
    )?;
    if updated == 0 {
        return Err(Error::StrategyNotFound(record.label.clone()));
    }
    Ok(())
}

fn record_values(record: &StrategyRecord) -> Vec<SqlValue> {
    fn opt_text(v: Option<String>) -> SqlValue {
        v.map_or(SqlValue::Null, SqlValue::Text)
    }
    fn opt_int(v: Option<i64>) -> SqlValue {
        v.map_or(SqlValue::Null, SqlValue::Integer)
    }

    vec![
        SqlValue::Text(record.label.clone()),
        SqlValue::Text(record.agent_id.clone()),
        SqlValue::Text(record.kind.as_str().to_string()),
        SqlValue::Text(format!("{:#x}", record.to_address)),
        SqlValue::Text(record.amount_wei.to_string()),
        SqlValue::Integer(record.interval_seconds as i64),
        SqlValue::Integer(record.enabled as i64),
        opt_int(record.max_base_fee_gwei.map(|g| g as i64)),
        opt_text(record.daily_cap_wei.map(|c| c.to_string())),
        opt_int(record.next_run_at.map(|t| t.timestamp_millis())),
        opt_int(record.last_run_at.map(|t| t.timestamp_millis())),
        opt_text(record.last_tx_hash.clone()),
        opt_text(record.spent_day.map(|d| d.format("%Y-%m-%d").to_string())),
        SqlValue::Text(record.spent_today_wei.to_string()),
        opt_text(record.confirmation_code.clone()),
        SqlValue::Integer(record.created_at.timestamp_millis()),
        SqlValue::Integer(record.updated_at.timestamp_millis()),
    ]
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StrategyRecord> {
    let to_address: String = row.get(3)?;
    let amount_wei: String = row.get(4)?;
    let daily_cap_wei: Option<String> = row.get(8)?;
    let spent_day: Option<String> = row.get(12)?;
    let spent_today_wei: String = row.get(13)?;
    let kind: String = row.get(2)?;

    Ok(StrategyRecord {
        label: row.get(0)?,
        agent_id: row.get(1)?,
        kind: StrategyKind::parse(&kind).unwrap_or(StrategyKind::RecurringTransfer),
        to_address: to_address.parse().unwrap_or(Address::ZERO),
        amount_wei: units::parse_wei(&amount_wei).unwrap_or(U256::ZERO),
        interval_seconds: row.get::<_, i64>(5)? as u64,
        enabled: row.get(6)?,
        max_base_fee_gwei: row.get::<_, Option<i64>>(7)?.map(|g| g as u64),
        daily_cap_wei: daily_cap_wei.and_then(|c| units::parse_wei(&c).ok()),
        next_run_at: row
            .get::<_, Option<i64>>(9)?
            .and_then(DateTime::from_timestamp_millis),
        last_run_at: row
            .get::<_, Option<i64>>(10)?
            .and_then(DateTime::from_timestamp_millis),
        last_tx_hash: row.get(11)?,
        spent_day: spent_day.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        spent_today_wei: units::parse_wei(&spent_today_wei).unwrap_or(U256::ZERO),
        confirmation_code: row.get(14)?,
        created_at: DateTime::from_timestamp_millis(row.get(15)?).unwrap_or_default(),
        updated_at: DateTime::from_timestamp_millis(row.get(16)?).unwrap_or_default(),
    })
}

fn parse_outcome(s: &str) -> Result<RunOutcome> {
    match s {
        "sent" => Ok(RunOutcome::Sent),
        "skipped_gas" => Ok(RunOutcome::SkippedGas),
        "skipped_cap" => Ok(RunOutcome::SkippedCap),
        "skipped_not_due" => Ok(RunOutcome::SkippedNotDue),
        "skipped_simulation" => Ok(RunOutcome::SkippedSimulation),
        "failed" => Ok(RunOutcome::Failed),
        other => Err(Error::Storage(format!("unknown run outcome '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn store() -> StrategyStore {
        StrategyStore::new(Db::open_in_memory().unwrap())
    }

    fn sample(label: &str) -> StrategyRecord {
        let now = Utc::now();
        StrategyRecord {
            label: label.to_string(),
            agent_id: "a1".to_string(),
            kind: StrategyKind::RecurringTransfer,
            to_address: address!("0000000000000000000000000000000000000001"),
            amount_wei: U256::from(10_000_000_000_000_000u64), // 0.01
            interval_seconds: 3600,
            enabled: false,
            max_base_fee_gwei: Some(10),
            daily_cap_wei: Some(U256::from(20_000_000_000_000_000u64)),
            next_run_at: None,
            last_run_at: None,
            last_tx_hash: None,
            spent_day: None,
            spent_today_wei: U256::ZERO,
            confirmation_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn insert_get_round_trip() {
        let store = store();
        store.insert(&sample("daily")).unwrap();

        let loaded = store.get("daily").unwrap();
        assert_eq!(loaded.label, "daily");
        assert_eq!(loaded.amount_wei, U256::from(10_000_000_000_000_000u64));
        assert_eq!(loaded.max_base_fee_gwei, Some(10));
        assert!(!loaded.enabled);
        assert!(loaded.next_run_at.is_none());
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let store = store();
        store.insert(&sample("daily")).unwrap();
        let err = store.insert(&sample("daily")).unwrap_err();
        assert_eq!(err.kind(), "strategy_bad_state");
    }

    #[test]
    fn missing_label_is_strategy_not_found() {
        let store = store();
        assert_eq!(store.get("ghost").unwrap_err().kind(), "strategy_not_found");
        assert_eq!(
            store.delete("ghost").unwrap_err().kind(),
            "strategy_not_found"
        );
    }

    #[test]
    fn update_with_run_commits_both_or_neither() {
        let store = store();
        store.insert(&sample("daily")).unwrap();

        let mut record = store.get("daily").unwrap();
        record.spent_today_wei = record.amount_wei;
        let run = RunRecord {
            strategy_label: "daily".to_string(),
            ran_at: Utc::now(),
            outcome: RunOutcome::Sent,
            tx_hash: Some("0xabc".to_string()),
            detail: None,
        };
        store.update_with_run(&record, &run).unwrap();

        assert_eq!(store.get("daily").unwrap().spent_today_wei, record.amount_wei);
        let runs = store.runs("daily", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Sent);

        // An update against a deleted strategy rolls the run record back too
        store.delete("daily").unwrap();
        let err = store.update_with_run(&record, &run).unwrap_err();
        assert_eq!(err.kind(), "strategy_not_found");
        let leaked: Vec<_> = store.runs("daily", 10).unwrap();
        assert_eq!(leaked.len(), 1, "no second run row after rollback");
    }

    #[test]
    fn run_history_is_newest_first() {
        let store = store();
        store.insert(&sample("daily")).unwrap();
        let record = store.get("daily").unwrap();

        let base = Utc::now();
        for (i, outcome) in [RunOutcome::Sent, RunOutcome::SkippedCap].iter().enumerate() {
            let run = RunRecord {
                strategy_label: "daily".to_string(),
                ran_at: base + chrono::Duration::seconds(i as i64),
                outcome: *outcome,
                tx_hash: None,
                detail: Some(serde_json::json!({"seq": i})),
            };
            store.update_with_run(&record, &run).unwrap();
        }

        let runs = store.runs("daily", 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].outcome, RunOutcome::SkippedCap);
        assert_eq!(runs[1].outcome, RunOutcome::Sent);
    }
}
