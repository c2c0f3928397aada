//! Append-only event journal
//!
//! Every tool invocation lands here exactly once, with its outcome. Records
//! are never mutated or deleted from within the core. The journal is also
//! the rate limiter's source of truth: window counts are computed over
//! `occurred_at`, so limits survive restarts and are exact.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::Db;
use crate::Result;

/// Invocation outcome as journaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Ok,
    Denied,
    Error,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Ok => "ok",
            EventStatus::Denied => "denied",
            EventStatus::Error => "error",
        }
    }
}

/// One journaled tool invocation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventRecord {
    pub occurred_at: DateTime<Utc>,
    pub tool_name: String,
    pub agent_id: Option<String>,
    pub status: String,
    pub request_digest: Option<String>,
    pub response_digest: Option<String>,
    pub error_kind: Option<String>,
}

/// Owner of the `events` table.
#[derive(Clone)]
pub struct EventJournal {
    db: Db,
}

impl EventJournal {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Append one event. Never updates an existing row.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        occurred_at: DateTime<Utc>,
        tool_name: &str,
        agent_id: Option<&str>,
        status: EventStatus,
        request_digest: Option<&str>,
        response_digest: Option<&str>,
        error_kind: Option<&str>,
    ) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events
                 (occurred_at, tool_name, agent_id, status, request_digest, response_digest, error_kind)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    occurred_at.timestamp_millis(),
                    tool_name,
                    agent_id,
                    status.as_str(),
                    request_digest,
                    response_digest,
                    error_kind,
                ],
            )?;
            Ok(())
        })
    }

    /// Count events for `(tool, agent)` with `occurred_at >= now - window`.
    ///
    /// No upper bound: events are never in the future, and excluding ones
    /// stamped in the same millisecond as `now` would under-count.
    pub fn count_in_window(
        &self,
        tool_name: &str,
        agent_id: Option<&str>,
        now: DateTime<Utc>,
        window_seconds: u64,
    ) -> Result<u64> {
        let cutoff = now.timestamp_millis() - (window_seconds as i64) * 1000;
        self.db.with_conn(|conn| {
            let count: i64 = match agent_id {
                Some(agent) => conn.query_row(
                    "SELECT COUNT(*) FROM events
                     WHERE tool_name = ?1 AND agent_id = ?2 AND occurred_at >= ?3",
                    params![tool_name, agent, cutoff],
                    |row| row.get(0),
                )?,
                None => conn.query_row(
                    "SELECT COUNT(*) FROM events
                     WHERE tool_name = ?1 AND agent_id IS NULL AND occurred_at >= ?2",
                    params![tool_name, cutoff],
                    |row| row.get(0),
                )?,
            };
            Ok(count as u64)
        })
    }

    /// Newest-first listing for operators.
    pub fn recent(&self, limit: u32) -> Result<Vec<EventRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT occurred_at, tool_name, agent_id, status,
                        request_digest, response_digest, error_kind
                 FROM events ORDER BY occurred_at DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(EventRecord {
                    occurred_at: DateTime::from_timestamp_millis(row.get(0)?).unwrap_or_default(),
                    tool_name: row.get(1)?,
                    agent_id: row.get(2)?,
                    status: row.get(3)?,
                    request_digest: row.get(4)?,
                    response_digest: row.get(5)?,
                    error_kind: row.get(6)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn journal() -> EventJournal {
        EventJournal::new(Db::open_in_memory().unwrap())
    }

    #[test]
    fn window_count_matches_predicate_exactly() {
        let journal = journal();
        let now = Utc::now();

        // Four inside the window (one exactly at the cutoff, one at `now`
        // itself), one aged out just past the cutoff.
        for offset_secs in [-30i64, -5, -60, -61, 0] {
            journal
                .append(
                    now + Duration::seconds(offset_secs),
                    "execute_transfer",
                    Some("a1"),
                    EventStatus::Ok,
                    None,
                    None,
                    None,
                )
                .unwrap();
        }

        let count = journal
            .count_in_window("execute_transfer", Some("a1"), now, 60)
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn counts_are_scoped_by_tool_and_agent() {
        let journal = journal();
        let now = Utc::now();
        journal
            .append(now, "execute_transfer", Some("a1"), EventStatus::Ok, None, None, None)
            .unwrap();
        journal
            .append(now, "execute_transfer", Some("a2"), EventStatus::Ok, None, None, None)
            .unwrap();
        journal
            .append(now, "query_balance", Some("a1"), EventStatus::Ok, None, None, None)
            .unwrap();

        let later = now + Duration::seconds(1);
        assert_eq!(
            journal
                .count_in_window("execute_transfer", Some("a1"), later, 60)
                .unwrap(),
            1
        );
        assert_eq!(
            journal
                .count_in_window("query_balance", Some("a1"), later, 60)
                .unwrap(),
            1
        );
        assert_eq!(
            journal
                .count_in_window("provider_status", None, later, 60)
                .unwrap(),
            0
        );
    }

    #[test]
    fn denied_and_error_events_are_recorded() {
        let journal = journal();
        let now = Utc::now();
        journal
            .append(
                now,
                "execute_transfer",
                Some("a1"),
                EventStatus::Denied,
                Some("{}"),
                None,
                Some("rate_limited"),
            )
            .unwrap();
        journal
            .append(
                now + Duration::seconds(1),
                "execute_transfer",
                Some("a1"),
                EventStatus::Error,
                Some("{}"),
                None,
                Some("insufficient_funds"),
            )
            .unwrap();

        let events = journal.recent(10).unwrap();
        assert_eq!(events.len(), 2);
        // Newest first
        assert_eq!(events[0].status, "error");
        assert_eq!(events[0].error_kind.as_deref(), Some("insufficient_funds"));
        assert_eq!(events[1].status, "denied");
    }
}
