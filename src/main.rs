//! Swing-trade risk controller: structural trailing stops, position
//! reconciliation, and a safety circuit breaker over an IB proxy.

mod api;
mod backtest;
mod bot;
mod config;
mod db;
mod executor;
mod jobs;
mod models;
mod notify;
mod reconcile;
mod retry;
mod safety;
mod trailing;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use api::{BrokerGateway, IbClient, MarketDataClient};
use backtest::{replay_symbol, ReplayConfig};
use bot::{Bot, ScheduleConfig};
use config::AppConfig;
use db::Database;
use executor::{ExecutorConfig, TradeExecutor};
use notify::{spawn_notifier, NotifyHandle, WebhookNotifier};
use reconcile::PositionReconciler;
use safety::{SafetyGate, SafetyLimits, TradeDecision};
use trailing::{TrailingConfig, TrailingStopEngine};

#[derive(Parser)]
#[command(name = "trailguard", about = "Swing-trade risk controller")]
struct Cli {
    /// Log filter (overrides RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler (reconciliation, daily reassessment, catch-up)
    Run,
    /// Show account, positions, and safety status
    Status,
    /// Reconcile the ledger against broker holdings
    Reconcile {
        /// Plan the repairs without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Reassess trailing stops for all open positions now
    Reassess,
    /// Drain the pending stop-update queue now
    Catchup,
    /// Pause trading until resumed
    Pause {
        /// Reason recorded with the pause
        reason: String,
    },
    /// Resume trading and reset the losing-streak counter
    Resume {
        /// Reason recorded with the resume
        #[arg(default_value = "operator resume")]
        reason: String,
    },
    /// Switch trading mode
    Mode {
        /// "paper" or "live"
        mode: String,
    },
    /// Show the active safety limits
    Limits,
    /// Open a position (gate-checked, broker-verified)
    Buy {
        symbol: String,
        shares: i64,
        /// Initial stop price; defaults to 5% under the fill
        #[arg(long)]
        stop: Option<Decimal>,
    },
    /// Close an open position
    Close { symbol: String },
    /// Replay the trailing-stop rules over historical bars
    Backtest {
        symbol: String,
        /// Start date (YYYY-MM-DD); defaults to 90 days ago
        #[arg(long)]
        from: Option<NaiveDate>,
        /// End date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Cut the replay after this many held days
        #[arg(long, default_value_t = 0)]
        max_days: usize,
    },
}

struct App {
    db: Database,
    broker: Arc<IbClient>,
    prices: Arc<MarketDataClient>,
    gate: Arc<SafetyGate>,
    notify: NotifyHandle,
}

impl App {
    async fn build(config: &AppConfig) -> Result<Self> {
        let db = Database::new(&config.database_url).await?;
        let broker = Arc::new(IbClient::new(&config.ib_proxy_url)?);
        let prices = Arc::new(MarketDataClient::new(&config.data_api_url)?);

        let notify = match &config.webhook_url {
            Some(url) => spawn_notifier(Arc::new(WebhookNotifier::new(url)?)),
            None => NotifyHandle::disabled(),
        };

        let gate = Arc::new(SafetyGate::new(
            db.clone(),
            SafetyLimits::default(),
            notify.clone(),
        ));

        Ok(Self {
            db,
            broker,
            prices,
            gate,
            notify,
        })
    }

    fn reconciler(&self) -> Arc<PositionReconciler> {
        Arc::new(PositionReconciler::new(
            self.db.clone(),
            self.broker.clone(),
            self.prices.clone(),
            self.notify.clone(),
        ))
    }

    fn engine(&self) -> Arc<TrailingStopEngine> {
        Arc::new(TrailingStopEngine::new(
            self.db.clone(),
            self.broker.clone(),
            self.prices.clone(),
            self.notify.clone(),
            TrailingConfig::default(),
        ))
    }

    fn executor(&self) -> TradeExecutor {
        TradeExecutor::new(
            self.db.clone(),
            self.broker.clone(),
            self.prices.clone(),
            self.gate.clone(),
            self.notify.clone(),
            ExecutorConfig::default(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env();
    let app = App::build(&config).await?;

    match cli.command {
        Commands::Run => {
            let bot = Bot::new(
                app.db.clone(),
                app.broker.clone(),
                app.gate.clone(),
                app.reconciler(),
                app.engine(),
                ScheduleConfig::default(),
            );
            bot.run().await?;
        }

        Commands::Status => {
            show_status(&app).await?;
        }

        Commands::Reconcile { dry_run } => {
            let report = app.reconciler().reconcile(dry_run).await?;
            if report.dry_run {
                println!("Dry run (no changes written):");
            }
            println!(
                "  synced: {:?}\n  closed: {:?}\n  updated: {:?}",
                report.synced, report.closed, report.updated
            );
            for err in &report.errors {
                println!("  error: {}", err);
            }
        }

        Commands::Reassess => {
            let report = app.engine().reassess_all_positions().await?;
            println!(
                "Checked {} positions: {} raised, {} unchanged, {} failed",
                report.checked, report.raised, report.unchanged, report.failures
            );
        }

        Commands::Catchup => {
            let engine = app.engine();
            let before = engine.pending_updates_count().await?;
            let succeeded = engine.process_pending_updates().await?;
            println!(
                "Caught up {} of {} pending stop updates",
                succeeded, before
            );
        }

        Commands::Pause { reason } => {
            app.gate.manual_pause(&reason).await?;
            println!("Trading paused: {}", reason);
        }

        Commands::Resume { reason } => {
            app.gate.resume_trading(&reason).await?;
            println!("Trading resumed ({}), losing streak reset", reason);
        }

        Commands::Mode { mode } => match mode.as_str() {
            "live" => match app.gate.switch_to_live().await? {
                TradeDecision::Allowed => println!("Switched to LIVE trading"),
                TradeDecision::Denied { reason } => println!("Refused: {}", reason),
            },
            "paper" => {
                app.gate.switch_to_paper().await?;
                println!("Switched to paper trading");
            }
            other => anyhow::bail!("Unknown mode '{}', expected paper or live", other),
        },

        Commands::Limits => {
            let limits = app.gate.limits().await;
            println!("Safety limits:");
            println!("  max daily loss:        {:.1}%", limits.max_daily_loss_pct * 100.0);
            println!("  max weekly loss:       {:.1}%", limits.max_weekly_loss_pct * 100.0);
            println!("  max consecutive losses: {}", limits.max_consecutive_losses);
            println!("  max open positions:     {}", limits.max_open_positions);
            println!("  max position size:     {:.0}%", limits.max_position_size_pct * 100.0);
            println!(
                "  live gate:             {} paper days, {} paper trades",
                limits.min_paper_days, limits.min_paper_trades
            );
        }

        Commands::Buy {
            symbol,
            shares,
            stop,
        } => {
            let symbol = symbol.to_uppercase();
            let id = app.executor().open_position(&symbol, shares, stop).await?;
            info!(symbol = %symbol, id = id, "Entry complete");
            println!("Opened {} x{} (position #{})", symbol, shares, id);
        }

        Commands::Close { symbol } => {
            let symbol = symbol.to_uppercase();
            let pnl = app.executor().close_position(&symbol).await?;
            println!("Closed {} (P&L {})", symbol, pnl);
        }

        Commands::Backtest {
            symbol,
            from,
            to,
            max_days,
        } => {
            let symbol = symbol.to_uppercase();
            let to = to.unwrap_or_else(|| Utc::now().date_naive());
            let from = from.unwrap_or(to - ChronoDuration::days(90));
            let cfg = ReplayConfig {
                max_days,
                ..Default::default()
            };
            let result = replay_symbol(app.prices.as_ref(), &symbol, from, to, &cfg).await?;
            print!("{}", result);
        }
    }

    Ok(())
}

async fn show_status(app: &App) -> Result<()> {
    let (status, account, broker_positions) = tokio::join!(
        app.broker.get_status(),
        app.broker.get_account_summary(),
        app.broker.get_positions(),
    );

    match status {
        Ok(s) => println!(
            "Gateway: {} ({})",
            if s.connected { "connected" } else { "DISCONNECTED" },
            s.trading_mode.as_deref().unwrap_or("unknown mode")
        ),
        Err(e) => println!("Gateway: unreachable ({})", e),
    }

    if let Ok(a) = account {
        println!(
            "Account: net {} / cash {} / buying power {}",
            a.net_liquidation, a.total_cash, a.buying_power
        );
    }

    let safety = app.gate.snapshot().await?;
    println!(
        "Mode: {} | paused: {}{}",
        safety.mode.as_str(),
        safety.is_paused,
        safety
            .pause_reason
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default()
    );
    println!(
        "P&L: {:.2} today / {:.2} this week | losing streak: {}",
        safety.daily_pnl, safety.weekly_pnl, safety.consecutive_losses
    );

    let positions = app.db.get_open_positions().await?;
    println!("Open positions: {}", positions.len());
    for p in &positions {
        let d = p.to_domain();
        println!(
            "  {} x{} @ {:.2}  stop {:.2}  last {:.2}  unrealized {}",
            p.symbol,
            p.shares,
            p.entry_price,
            p.stop_price,
            p.current_price,
            d.unrealized_pnl().round_dp(2)
        );
    }

    if let Ok(broker_positions) = broker_positions {
        let drift: Vec<_> = broker_positions
            .iter()
            .filter(|bp| !positions.iter().any(|p| p.symbol == bp.symbol))
            .collect();
        if !drift.is_empty() {
            println!("Broker holdings missing from the ledger (run reconcile):");
            for bp in drift {
                println!("  {} x{} @ {}", bp.symbol, bp.qty, bp.avg_cost);
            }
        }
    }

    let pending = app.db.count_pending_updates().await?;
    if pending > 0 {
        println!("Pending stop updates awaiting catch-up: {}", pending);
    }

    if let Some(run) = app
        .db
        .get_job_runs(trailing::engine::REASSESS_JOB, 1)
        .await?
        .into_iter()
        .next()
    {
        println!(
            "Last reassessment: {} ({}, {} checked / {} raised / {} failed)",
            run.started_at, run.status, run.checked, run.raised, run.failures
        );
    }
    if let Some(ts) = app.db.get_meta("last_reconciliation").await? {
        println!("Last reconciliation: {}", ts);
    }

    Ok(())
}
