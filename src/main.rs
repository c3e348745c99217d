use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use trendalert::exchange::binance::BinanceClient;
use trendalert::exchange::csv_feed::{CsvFeed, SymbolFeed};
use trendalert::exchange::Exchange;
use trendalert::notification::{LogNotifier, Notifier, TelegramNotifier};
use trendalert::shutdown::{self, ShutdownTrigger};
use trendalert::{AlertBot, AppConfig};

#[derive(Parser)]
#[command(name = "trendalert", about = "Moving-average crossover alerts for Binance pairs")]
struct Cli {
    /// Config file (TOML/JSON). Defaults to config/default when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch live Binance klines and send alerts to Telegram.
    Run,
    /// Replay CSV candles and log the alerts.
    Backtest {
        /// Feed as SYMBOL:TIMEFRAME:FILE, e.g. BTCUSDT:4h:data/btc-4h.csv
        #[arg(long = "feed", required = true)]
        feeds: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let (trigger, shutdown) = shutdown::channel();
    spawn_ctrl_c_handler(trigger);

    match cli.command {
        Commands::Run => run_live(config, shutdown).await,
        Commands::Backtest { feeds } => run_backtest(config, &feeds, shutdown).await,
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trendalert=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn spawn_ctrl_c_handler(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down...");
            trigger.trigger();
        }
    });
}

async fn run_live(config: AppConfig, shutdown: shutdown::Shutdown) -> Result<()> {
    config.validate_live().context("Live mode needs Binance and Telegram credentials")?;

    let binance = BinanceClient::new(&config.binance).context("Failed to build Binance client")?;
    binance.ping().await.context("Binance is unreachable")?;
    tracing::info!(base_url = %config.binance.base_url, "Connected to Binance");

    let telegram = TelegramNotifier::new(&config.telegram).context("Failed to build Telegram notifier")?;

    let exchange: Arc<dyn Exchange> = Arc::new(binance);
    let notifier: Arc<dyn Notifier> = Arc::new(telegram);
    AlertBot::new(config, exchange, notifier)
        .run(shutdown)
        .await
        .context("Alert bot failed")
}

async fn run_backtest(mut config: AppConfig, args: &[String], shutdown: shutdown::Shutdown) -> Result<()> {
    let feeds = args
        .iter()
        .map(|arg| parse_feed(arg, &config.quote_asset))
        .collect::<Result<Vec<_>>>()?;

    // Replay exactly the pairs on the command line
    let symbols: BTreeSet<String> = feeds.iter().map(|f| f.symbol_info.symbol.clone()).collect();
    let timeframes: BTreeSet<String> = feeds.iter().map(|f| f.timeframe.clone()).collect();
    config.symbols = symbols.into_iter().collect();
    config.timeframes = timeframes.into_iter().collect();
    config.validate().context("Invalid backtest configuration")?;

    let feed = CsvFeed::new(feeds).context("Failed to load CSV feeds")?;
    let exchange: Arc<dyn Exchange> = Arc::new(feed);
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    AlertBot::new(config, exchange, notifier)
        .run(shutdown)
        .await
        .context("Backtest failed")
}

fn parse_feed(arg: &str, quote_asset: &str) -> Result<SymbolFeed> {
    let mut parts = arg.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(symbol), Some(timeframe), Some(file))
            if !symbol.is_empty() && !timeframe.is_empty() && !file.is_empty() =>
        {
            Ok(SymbolFeed::new(symbol, timeframe, file, quote_asset))
        }
        _ => bail!("Invalid feed '{}', expected SYMBOL:TIMEFRAME:FILE", arg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_feed() {
        let feed = parse_feed("BTCUSDT:4h:data/btc:4h.csv", "USDT").unwrap();
        assert_eq!(feed.symbol_info.symbol, "BTCUSDT");
        assert_eq!(feed.symbol_info.base_asset, "BTC");
        assert_eq!(feed.timeframe, "4h");
        assert_eq!(feed.file, PathBuf::from("data/btc:4h.csv"));

        assert!(parse_feed("BTCUSDT:4h", "USDT").is_err());
        assert!(parse_feed("BTCUSDT::file.csv", "USDT").is_err());
    }

    #[test]
    fn test_cli_parses_backtest_feeds() {
        let cli = Cli::try_parse_from([
            "trendalert",
            "backtest",
            "--feed",
            "BTCUSDT:4h:btc.csv",
            "--feed",
            "ETHUSDT:4h:eth.csv",
        ])
        .unwrap();
        match cli.command {
            Commands::Backtest { feeds } => assert_eq!(feeds.len(), 2),
            Commands::Run => panic!("expected backtest"),
        }
    }
}
