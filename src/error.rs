//! Error types for the wallet core
//!
//! The error set is a closed enumeration: callers branch on [`Error::kind`],
//! never on message text. Messages carry the minimum identifying context
//! (an agent id, a strategy label) and never key material, ciphertext, or
//! confirmation codes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Lookup
    #[error("no wallet for agent '{0}'")]
    NotFound(String),

    #[error("wallet for agent '{0}' already exists")]
    AgentExists(String),

    #[error("address is already bound to another agent")]
    AddressReuse,

    #[error("invalid address: {0}")]
    BadAddress(String),

    #[error("invalid key material")]
    BadKey,

    // Crypto
    #[error("decryption failed")]
    DecryptFailed,

    #[error("export denied")]
    ExportDenied,

    // Policy
    #[error("rate limit exceeded for tool '{tool}'")]
    RateLimited { tool: String },

    #[error("transfer exceeds the spend threshold; confirmation code required")]
    ConfirmationRequired,

    #[error("confirmation code mismatch")]
    ConfirmationMismatch,

    // Funds / chain
    #[error("insufficient funds: need {needed} wei, have {available} wei")]
    InsufficientFunds { needed: String, available: String },

    #[error("chain unreachable: {0}")]
    ChainUnreachable(String),

    #[error("transaction rejected by node: {0}")]
    RpcRejected(String),

    #[error("broadcast state for this address requires operator intervention")]
    BroadcastAborted,

    // Strategy
    #[error("strategy '{0}' not found")]
    StrategyNotFound(String),

    #[error("strategy '{0}' is not in a state that allows this operation")]
    StrategyBadState(String),

    // Infrastructure
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Stable machine-readable kind for this error.
    ///
    /// These strings are part of the tool interface: they appear in journal
    /// records and tool error payloads, and callers dispatch on them.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::AgentExists(_) => "agent_exists",
            Error::AddressReuse => "address_reuse",
            Error::BadAddress(_) => "bad_address",
            Error::BadKey => "bad_key",
            Error::DecryptFailed => "decrypt_failed",
            Error::ExportDenied => "export_denied",
            Error::RateLimited { .. } => "rate_limited",
            Error::ConfirmationRequired => "confirmation_required",
            Error::ConfirmationMismatch => "confirmation_mismatch",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::ChainUnreachable(_) => "chain_unreachable",
            Error::RpcRejected(_) => "rpc_rejected",
            Error::BroadcastAborted => "broadcast_aborted",
            Error::StrategyNotFound(_) => "strategy_not_found",
            Error::StrategyBadState(_) => "strategy_bad_state",
            Error::Config(_) => "config",
            Error::Storage(_) => "storage",
            Error::InvalidArgument(_) => "invalid_argument",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
