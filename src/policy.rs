//! Policy engine
//!
//! Gates every tool invocation with a journal-backed rate limit and writes
//! an audit record once the guarded call settles. Counting over the journal
//! instead of an in-memory bucket is deliberate: it survives restarts and
//! is exact. The read-and-append is not atomic with the guarded operation;
//! over-limiting by one call under a race is acceptable, silent
//! under-counting is not.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::Config;
use crate::store::journal::{EventJournal, EventStatus};
use crate::{Error, Result};

/// Marker substituted for secret-bearing values before journaling.
pub const REDACTED: &str = "[REDACTED]";

/// JSON keys whose values never reach the journal.
const SECRET_KEYS: &[&str] = &[
    "private_key",
    "mnemonic",
    "passphrase",
    "password",
    "confirmation_code",
    "keystore_json",
];

pub struct PolicyEngine {
    config: Arc<Config>,
    journal: EventJournal,
}

impl PolicyEngine {
    pub fn new(config: Arc<Config>, journal: EventJournal) -> Self {
        Self { config, journal }
    }

    /// Deny the invocation if the matching rule's window is already full.
    ///
    /// Runs before any work; a denial is also journaled (by
    /// [`PolicyEngine::record`]) and therefore counts toward the window.
    pub fn enforce(&self, tool: &str, agent_id: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        let rule = self.config.rate_limits.rule_for(tool, agent_id);
        if rule.max_calls == 0 {
            return Err(Error::RateLimited {
                tool: tool.to_string(),
            });
        }
        let recent = self
            .journal
            .count_in_window(tool, agent_id, now, rule.window_seconds)?;
        if recent >= rule.max_calls as u64 {
            tracing::warn!(
                tool = tool,
                agent_id = ?agent_id,
                recent,
                max_calls = rule.max_calls,
                "rate limit exceeded"
            );
            return Err(Error::RateLimited {
                tool: tool.to_string(),
            });
        }
        Ok(())
    }

    /// Journal the outcome of a guarded call.
    ///
    /// Journal failures never change the caller-visible outcome; they are
    /// logged at error level and swallowed.
    pub fn record(
        &self,
        tool: &str,
        agent_id: Option<&str>,
        now: DateTime<Utc>,
        request: &Value,
        outcome: &Result<Value>,
    ) {
        let request_digest = redact(request).to_string();
        let (status, response_digest, error_kind) = match outcome {
            Ok(response) => (EventStatus::Ok, Some(redact(response).to_string()), None),
            Err(Error::RateLimited { .. }) => (EventStatus::Denied, None, Some("rate_limited")),
            Err(e) => (EventStatus::Error, None, Some(e.kind())),
        };

        if let Err(e) = self.journal.append(
            now,
            tool,
            agent_id,
            status,
            Some(&request_digest),
            response_digest.as_deref(),
            error_kind,
        ) {
            tracing::error!(tool = tool, error = %e, "journal write failed");
        }
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }
}

/// Replace the values of secret-bearing keys, recursively.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                if SECRET_KEYS.contains(&key.as_str()) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact(inner));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}
