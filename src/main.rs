//! AgentVault CLI
//!
//! Thin adapter over the tool router: every subcommand builds a tool
//! argument map and dispatches it, so the CLI exercises exactly the surface
//! an RPC transport would.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agentvault::{tools, Config, Error, Result};

#[derive(Parser)]
#[command(name = "agentvault")]
#[command(about = "Custodial wallet and strategy core for autonomous agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a wallet for an agent
    CreateWallet { agent_id: String },

    /// Import a wallet from a raw private key
    ImportKey {
        agent_id: String,
        private_key: String,
    },

    /// Import a wallet from a mnemonic phrase
    ImportMnemonic { agent_id: String, mnemonic: String },

    /// List all wallets
    ListWallets,

    /// Query an agent's native balance
    Balance { agent_id: String },

    /// Send native currency
    Transfer {
        agent_id: String,
        to: String,
        amount: String,

        /// Confirmation code for transfers above the spend threshold
        #[arg(long)]
        confirmation_code: Option<String>,

        /// Pre-flight only; no signing or broadcast
        #[arg(long)]
        dry_run: bool,
    },

    /// Pre-flight a transfer without broadcasting
    Simulate {
        agent_id: String,
        to: String,
        amount: String,
    },

    /// Sign a personal message
    Sign { agent_id: String, message: String },

    /// Export an agent's key as an encrypted keystore document
    ExportKeystore { agent_id: String, passphrase: String },

    /// Show chain connectivity and fee state
    ProviderStatus,

    /// Inspect an on-chain address
    Inspect { address: String },

    /// Manage recurring strategies
    Strategy {
        #[command(subcommand)]
        command: StrategyCommands,
    },

    /// Invoke any tool by name with a JSON argument map
    Call {
        tool: String,

        /// JSON arguments, e.g. '{"agent_id": "a1"}'
        args: Option<String>,
    },

    /// Run the strategy scheduler loop
    Scheduler {
        /// Seconds between passes over the enabled strategies
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },
}

#[derive(Subcommand)]
enum StrategyCommands {
    /// Create a recurring transfer strategy (disabled until started)
    Create {
        label: String,
        agent_id: String,
        to_address: String,
        amount: String,
        interval_seconds: u64,

        /// Skip runs while the base fee is above this ceiling
        #[arg(long)]
        max_base_fee_gwei: Option<u64>,

        /// Stop sending once this much has gone out in a UTC day
        #[arg(long)]
        daily_cap: Option<String>,

        /// Confirmation code used when a run crosses the spend threshold
        #[arg(long)]
        confirmation_code: Option<String>,
    },
    Start { label: String },
    Stop { label: String },
    Delete { label: String },
    /// Evaluate the strategy once
    Tick { label: String },
    List,
    Status { label: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                json!({ "error": e.kind(), "message": e.to_string() })
            );
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = Config::from_env()?;
    let router = agentvault::bootstrap(config)?;

    let (tool, args) = match command {
        Commands::CreateWallet { agent_id } => {
            (tools::TOOL_CREATE_WALLET, json!({ "agent_id": agent_id }))
        }
        Commands::ImportKey {
            agent_id,
            private_key,
        } => (
            tools::TOOL_IMPORT_WALLET_PRIVKEY,
            json!({ "agent_id": agent_id, "private_key": private_key }),
        ),
        Commands::ImportMnemonic { agent_id, mnemonic } => (
            tools::TOOL_IMPORT_WALLET_MNEMONIC,
            json!({ "agent_id": agent_id, "mnemonic": mnemonic }),
        ),
        Commands::ListWallets => (tools::TOOL_LIST_WALLETS, json!({})),
        Commands::Balance { agent_id } => {
            (tools::TOOL_QUERY_BALANCE, json!({ "agent_id": agent_id }))
        }
        Commands::Transfer {
            agent_id,
            to,
            amount,
            confirmation_code,
            dry_run,
        } => (
            tools::TOOL_EXECUTE_TRANSFER,
            json!({
                "agent_id": agent_id,
                "to": to,
                "amount": amount,
                "confirmation_code": confirmation_code,
                "dry_run": dry_run,
            }),
        ),
        Commands::Simulate {
            agent_id,
            to,
            amount,
        } => (
            tools::TOOL_SIMULATE_TRANSFER,
            json!({ "agent_id": agent_id, "to": to, "amount": amount }),
        ),
        Commands::Sign { agent_id, message } => (
            tools::TOOL_SIGN_MESSAGE,
            json!({ "agent_id": agent_id, "message": message }),
        ),
        Commands::ExportKeystore {
            agent_id,
            passphrase,
        } => (
            tools::TOOL_EXPORT_KEYSTORE,
            json!({ "agent_id": agent_id, "passphrase": passphrase }),
        ),
        Commands::ProviderStatus => (tools::TOOL_PROVIDER_STATUS, json!({})),
        Commands::Inspect { address } => {
            (tools::TOOL_INSPECT_CONTRACT, json!({ "address": address }))
        }
        Commands::Strategy { command } => strategy_call(command),
        Commands::Call { tool, args } => {
            let parsed: Value = match args {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| Error::InvalidArgument(format!("arguments must be JSON: {e}")))?,
                None => json!({}),
            };
            return dispatch_and_print(&router, &tool, parsed).await;
        }
        Commands::Scheduler { interval_secs } => {
            return run_scheduler(&router, interval_secs).await;
        }
    };

    dispatch_and_print(&router, tool, args).await
}

fn strategy_call(command: StrategyCommands) -> (&'static str, Value) {
    match command {
        StrategyCommands::Create {
            label,
            agent_id,
            to_address,
            amount,
            interval_seconds,
            max_base_fee_gwei,
            daily_cap,
            confirmation_code,
        } => (
            tools::TOOL_CREATE_STRATEGY,
            json!({
                "label": label,
                "agent_id": agent_id,
                "to_address": to_address,
                "amount": amount,
                "interval_seconds": interval_seconds,
                "max_base_fee_gwei": max_base_fee_gwei,
                "daily_cap": daily_cap,
                "confirmation_code": confirmation_code,
            }),
        ),
        StrategyCommands::Start { label } => {
            (tools::TOOL_START_STRATEGY, json!({ "label": label }))
        }
        StrategyCommands::Stop { label } => (tools::TOOL_STOP_STRATEGY, json!({ "label": label })),
        StrategyCommands::Delete { label } => {
            (tools::TOOL_DELETE_STRATEGY, json!({ "label": label }))
        }
        StrategyCommands::Tick { label } => (tools::TOOL_TICK_STRATEGY, json!({ "label": label })),
        StrategyCommands::List => (tools::TOOL_LIST_STRATEGIES, json!({})),
        StrategyCommands::Status { label } => {
            (tools::TOOL_STRATEGY_STATUS, json!({ "label": label }))
        }
    }
}

async fn dispatch_and_print(router: &tools::ToolRouter, tool: &str, args: Value) -> Result<()> {
    let result = router.dispatch(tool, args).await?;
    println!("{}", serde_json::to_string_pretty(&result).unwrap());
    Ok(())
}

async fn run_scheduler(router: &tools::ToolRouter, interval_secs: u64) -> Result<()> {
    tracing::info!(interval_secs, "scheduler started");
    loop {
        match router.tick_all().await {
            Ok(reports) => {
                for report in &reports {
                    tracing::info!(report = %report, "tick");
                }
            }
            Err(e) => tracing::error!(error = %e, "scheduler pass failed"),
        }
        tokio::time::sleep(std::time::Duration::from_secs(interval_secs.max(1))).await;
    }
}
