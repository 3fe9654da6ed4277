//! Alert Trader
//!
//! Receives trade alerts over a webhook and gates them through a
//! loss/profit cycle: after a loss it waits for a profit, then follows the
//! very next entry on a futures account.

mod api;
mod db;
mod events;
mod models;
mod relay;
mod server;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::FuturesClient;
use crate::db::{Database, MemoryStore};
use crate::events::{ActivityLog, Broadcaster, EventFanout};
use crate::models::{Alert, CycleState};
use crate::relay::SignalRelay;
use crate::server::WebhookServer;
use crate::trading::{ExecutionEngine, TradingConfig};

/// Webhook-driven futures trading bot CLI.
#[derive(Parser)]
#[command(name = "alerttrader")]
#[command(about = "Follow trade alerts through a loss/profit cycle", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./alerttrader.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the trading configuration.
#[derive(Args, Clone)]
struct TradingArgs {
    /// Pair used when an alert carries none
    #[arg(long, env = "ALERT_SYMBOL")]
    symbol: Option<String>,

    /// Margin per trade in USDT
    #[arg(long, env = "ALERT_BASE_MARGIN")]
    base_margin: Option<Decimal>,

    /// Leverage for normal trades
    #[arg(long, env = "ALERT_LOW_LEVERAGE")]
    low_leverage: Option<u32>,

    /// Leverage for doubled trades
    #[arg(long, env = "ALERT_HIGH_LEVERAGE")]
    high_leverage: Option<u32>,
}

impl TradingArgs {
    fn to_config(&self) -> TradingConfig {
        let mut config = TradingConfig::default();
        if let Some(symbol) = &self.symbol {
            config.default_symbol = symbol.trim().to_uppercase();
        }
        if let Some(margin) = self.base_margin {
            config.base_margin = margin;
        }
        if let Some(leverage) = self.low_leverage {
            config.low_leverage = leverage;
        }
        if let Some(leverage) = self.high_leverage {
            config.high_leverage = leverage;
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000", env = "PORT")]
        port: u16,

        /// Dry run (don't execute trades)
        #[arg(long)]
        dry_run: bool,

        /// File receiving accepted trades
        #[arg(long, default_value = "signal-log.json")]
        activity_log: PathBuf,

        #[command(flatten)]
        trading: TradingArgs,
    },

    /// Show the persisted cycle state
    Status {
        /// Trading pair (all pairs when omitted)
        #[arg(short, long)]
        pair: Option<String>,
    },

    /// Reset a pair to the start of the cycle
    Reset {
        /// Trading pair
        #[arg(short, long, default_value = "ETHUSDT")]
        pair: String,
    },

    /// List recently received alerts
    Alerts {
        /// Maximum number of alerts to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Replay signals through a fresh cycle without trading
    Feed {
        /// Signal texts, e.g. "buy sl" "buy tp" "sell"
        #[arg(required = true)]
        signals: Vec<String>,

        /// Trading pair
        #[arg(short, long)]
        pair: Option<String>,
    },

    /// Show current configuration
    Config {
        #[command(flatten)]
        trading: TradingArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve {
            port,
            dry_run,
            activity_log,
            trading,
        } => {
            let config = trading.to_config();
            let db = Arc::new(Database::new(&cli.database).await?);
            db.ensure_state(&config.default_symbol).await?;

            let broadcaster = Broadcaster::new();
            let events = EventFanout::new()
                .with_sink(Arc::new(broadcaster.clone()))
                .with_sink(Arc::new(ActivityLog::new(&activity_log)));

            let mut relay = SignalRelay::new(config.clone(), db.clone(), events).with_archive(db);

            let live = if dry_run {
                false
            } else {
                match FuturesClient::from_env() {
                    Ok(client) => {
                        let engine = ExecutionEngine::new(config.clone(), Arc::new(client));
                        relay = relay.with_engine(Arc::new(engine));
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, "Exchange credentials unavailable, running in dry-run mode");
                        false
                    }
                }
            };

            println!("\n=== Alert Trader ===");
            println!("Default pair:     {}", config.default_symbol);
            println!("Base margin:      ${}", config.base_margin);
            println!("Leverage:         {}x / {}x doubled", config.low_leverage, config.high_leverage);
            println!("Mode:             {}", if live { "LIVE TRADING" } else { "DRY RUN (no real trades)" });
            println!("Activity log:     {}", activity_log.display());
            println!("\nPress Ctrl+C to stop.\n");

            let server = WebhookServer::new(Arc::new(relay), broadcaster);
            server.serve(&format!("0.0.0.0:{}", port)).await?;
            info!("Server stopped");
        }

        Commands::Status { pair } => {
            let db = Database::new(&cli.database).await?;

            let states = match pair {
                Some(pair) => {
                    let pair = pair.trim().to_uppercase();
                    let state = db.load_state(&pair).await?;
                    vec![(pair, state)]
                }
                None => db.list_states().await?,
            };

            if states.is_empty() {
                println!("No cycle state stored yet. Run 'alerttrader serve' to start.");
                return Ok(());
            }

            println!("\n=== Cycle State ===");
            for (pair, state) in &states {
                print_state(pair, state);
            }
        }

        Commands::Reset { pair } => {
            let db = Database::new(&cli.database).await?;
            let pair = pair.trim().to_uppercase();

            let before = db.load_state(&pair).await?;
            db.reset_state(&pair).await?;

            info!(pair = %pair, from = %before.mode, "Cycle state reset");
            println!("Reset {} from {} to {}", pair, before.mode, CycleState::default().mode);
        }

        Commands::Alerts { limit } => {
            let db = Database::new(&cli.database).await?;
            let alerts = db.recent_alerts(limit).await?;

            if alerts.is_empty() {
                println!("No alerts received yet.");
                return Ok(());
            }

            println!("\n{:<20} {:<12} {:<16} {}", "RECEIVED", "PAIR", "SIGNAL", "PAYLOAD");
            println!("{}", "-".repeat(90));

            for alert in alerts {
                println!(
                    "{:<20} {:<12} {:<16} {}",
                    alert.received_at.format("%Y-%m-%d %H:%M:%S"),
                    alert.pair,
                    truncate(alert.signal.as_deref().unwrap_or("-"), 16),
                    truncate(&alert.payload, 40)
                );
            }
        }

        Commands::Feed { signals, pair } => {
            let config = TradingConfig::default();
            let relay = SignalRelay::new(config, Arc::new(MemoryStore::new()), EventFanout::new());

            println!("\n{:<14} {:<8} {:<24} {}", "SIGNAL", "ACTION", "MODE", "INFO");
            println!("{}", "-".repeat(100));

            for signal in signals {
                let mut alert = Alert::new(&signal);
                if let Some(pair) = &pair {
                    alert = alert.with_pair(pair);
                }

                match relay.handle(&alert).await {
                    Ok(outcome) => println!(
                        "{:<14} {:<8} {:<24} {}",
                        truncate(&signal, 14),
                        outcome.decision.as_ref().map(|d| d.tag()).unwrap_or("-"),
                        outcome.mode,
                        outcome.info
                    ),
                    Err(e) => println!("{:<14} {:<8} {}", truncate(&signal, 14), "reject", e),
                }
            }
        }

        Commands::Config { trading } => {
            let config = trading.to_config();

            println!("\n=== Trading Configuration ===\n");
            println!("Sizing:");
            println!("  Default Pair:         {}", config.default_symbol);
            println!("  Base Margin:          ${}", config.base_margin);
            println!("  Min Notional:         ${}", config.min_notional);
            println!("  Lot Precision:        {} decimals", config.lot_precision);

            println!("\nLeverage:");
            println!("  Normal Trades:        {}x", config.low_leverage);
            println!("  Doubled Trades:       {}x", config.high_leverage);

            println!("\nExchange:");
            println!("  Request Timeout:      {}s", config.request_timeout_secs);
            println!("  Read Retry Budget:    {}ms", config.read_retry_max_elapsed_ms);
            println!("  Flat Position Below:  {}", config.position_epsilon);
            println!(
                "  Credentials:          {}",
                if FuturesClient::from_env().is_ok() { "configured" } else { "missing (dry run)" }
            );
        }
    }

    Ok(())
}

fn print_state(pair: &str, state: &CycleState) {
    println!("\n{}", pair);
    println!("  Mode:               {}", state.mode);
    println!("  Consecutive Losses: {}", state.consecutive_losses);
    println!("  Size Multiplier:    {}x", state.size_multiplier);
    if state.halt_profit_count > 0 {
        println!("  Halt Profits:       {}", state.halt_profit_count);
    }
    if let Some(entry) = &state.pending_entry {
        println!(
            "  Open Entry:         {} at {}",
            entry.text,
            entry.received_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
