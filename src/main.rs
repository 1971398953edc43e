//! Custody assistant CLI
//!
//! Operator commands over the same components the chat front end uses.

use alloy::primitives::{Address, U256};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use yield_custody::quote::QuoteRequest;
use yield_custody::store::Database;
use yield_custody::{services, Config, Error, Result, RpcConfig, Services, KEYSTORE_MASTER_KEY_ENV};

#[derive(Parser)]
#[command(name = "yield-custody")]
#[command(about = "Custodial yield assistant: balances, reconciliation and export checks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Show liquid and protocol balances for an address
    Balance {
        #[arg(long)]
        address: String,
    },

    /// Reconcile a user's stored positions against the chain
    Reconcile {
        #[arg(long)]
        user: i64,
    },

    /// Run the key export safety check for a user
    ExportCheck {
        #[arg(long)]
        user: i64,
    },

    /// Get a swap quote
    Quote {
        /// Input token address
        #[arg(long)]
        input: String,

        /// Output token address
        #[arg(long)]
        output: String,

        /// Amount in raw token units
        #[arg(long)]
        amount: String,

        /// Address that would execute the swap
        #[arg(long)]
        from: String,

        /// Slippage tolerance in percent
        #[arg(long, default_value_t = 0.5)]
        slippage: f64,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore if not found)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env();
            config
        }
    };

    match cli.command {
        Commands::Migrate => run_migrate(&config).await?,
        Commands::Balance { address } => run_balance(config, &address).await?,
        Commands::Reconcile { user } => {
            let services = connect(config).await?;
            let report = services.reconciler.reconcile(user).await?;
            print_json(&report)?;
        }
        Commands::ExportCheck { user } => {
            let services = connect(config).await?;
            match services.gate.can_export(user).await {
                Ok(decision) => print_json(&decision)?,
                Err(e @ Error::SafetyBlocked { .. }) => {
                    println!("Export BLOCKED: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Commands::Quote {
            input,
            output,
            amount,
            from,
            slippage,
        } => {
            let router = services::quote_router(&config.quotes)?;
            let request = QuoteRequest {
                chain_id: config.network.chain_id(),
                token_in: parse_address("input", &input)?,
                token_out: parse_address("output", &output)?,
                amount_in: U256::from_str(amount.trim()).map_err(|e| {
                    Error::InvalidArgument(format!("Invalid amount '{}': {}", amount, e))
                })?,
                user_address: parse_address("from", &from)?,
                slippage_percent: slippage,
            };
            let quote = router.get_quote(&request).await?;
            print_json(&quote)?;
        }
        Commands::Config => print_json(&config)?,
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .init();
}

async fn connect(config: Config) -> Result<Services> {
    let master_key = std::env::var(KEYSTORE_MASTER_KEY_ENV)
        .map(SecretString::from)
        .map_err(|_| Error::Config(format!("{} is not set", KEYSTORE_MASTER_KEY_ENV)))?;
    Services::connect(config, &RpcConfig::from_env(), &master_key).await
}

async fn run_migrate(config: &Config) -> Result<()> {
    let db = Database::connect(&config.database_url).await?;
    let applied = db.run_migrations().await?;
    if applied.is_empty() {
        println!("Database is up to date");
    } else {
        for name in applied {
            println!("Applied {}", name);
        }
    }
    Ok(())
}

async fn run_balance(config: Config, address: &str) -> Result<()> {
    let owner = parse_address("address", address)?;
    let services = connect(config).await?;

    tracing::info!(address = %owner, "Reading balances");
    let balances = services.balances.get_all_balances(owner).await;

    for balance in balances.iter().filter(|b| !b.is_zero()) {
        println!(
            "{:<12} {:>18.6} {:<6} ${:>12.2}",
            balance.source.to_string(),
            balance.amount,
            balance.token_symbol,
            balance.value_usd
        );
    }
    println!(
        "{:<12} {:>18} {:<6} ${:>12.2}",
        "total",
        "",
        "",
        yield_custody::balances::total_value_usd(&balances)
    );
    Ok(())
}

fn parse_address(field: &str, raw: &str) -> Result<Address> {
    Address::from_str(raw.trim())
        .map_err(|e| Error::InvalidArgument(format!("Invalid {} address '{}': {}", field, raw, e)))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
