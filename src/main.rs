use anyhow::{Context, Result};
use breakoutbot::api::HttpPriceFeed;
use breakoutbot::commands::CommandHandler;
use breakoutbot::exchange::{Exchange, PaperExchange};
use breakoutbot::execution::PriceFeed;
use breakoutbot::notify::{LogSink, Notifier};
use breakoutbot::persistence::{MemoryPositionStore, PositionStore, RedisPositionStore};
use breakoutbot::runtime::{Runtime, RuntimeOptions};
use breakoutbot::settings::{ConfigStore, Settings};
use clap::Parser;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "breakoutbot", about = "Breakout, trailing stop and arbitrage trading bot")]
struct Args {
    /// Settings file, extension optional
    #[arg(short, long, default_value = "Settings")]
    config: String,

    /// Paper balance override, e.g. --balance USDT=1000 (repeatable)
    #[arg(long = "balance", value_parser = parse_balance)]
    balances: Vec<(String, Decimal)>,

    /// Name used to authorize commands typed on stdin
    #[arg(long, default_value = "operator")]
    operator: String,
}

fn parse_balance(raw: &str) -> std::result::Result<(String, Decimal), String> {
    let (asset, amount) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ASSET=AMOUNT, got {}", raw))?;
    let amount = Decimal::from_str(amount).map_err(|e| e.to_string())?;
    Ok((asset.to_uppercase(), amount))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut settings = Settings::load(&args.config).context("Failed to load settings")?;
    settings.paper_balances.extend(args.balances.iter().cloned());

    tracing::info!("🚀 breakoutbot starting");
    log_settings(&settings);

    let config = ConfigStore::new(settings.strategy.clone()).context("Invalid strategy settings")?;

    let mut feeds: Vec<Arc<dyn PriceFeed>> = Vec::new();
    let mut exchanges: HashMap<String, Arc<dyn Exchange>> = HashMap::new();
    for venue in &settings.venues {
        let feed: Arc<dyn PriceFeed> = Arc::new(
            HttpPriceFeed::new(&venue.name, &venue.feed_url, venue.requests_per_second)
                .with_context(|| format!("Failed to set up feed for {}", venue.name))?
                .with_order_book(venue.use_order_book),
        );
        let exchange = PaperExchange::new(&venue.name, settings.paper_balances.clone())
            .with_feed(feed.clone());

        feeds.push(feed);
        exchanges.insert(venue.name.clone(), Arc::new(exchange));
    }

    let store = connect_store(settings.redis_url.as_deref()).await;
    let notifier = Notifier::new(vec![Arc::new(LogSink)]);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let commands =
        CommandHandler::with_operators(config.clone(), notifier.clone(), &settings.operators);
    tokio::spawn(command_loop(commands, args.operator.clone(), shutdown_rx.clone()));

    let runtime = Runtime::new(
        RuntimeOptions::from(&settings),
        feeds,
        exchanges,
        config,
        store,
        notifier,
    );
    let mut runtime_task = tokio::spawn(runtime.run(shutdown_rx));

    tracing::info!("Press Ctrl+C to stop, type /help for commands");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        result = &mut runtime_task => {
            tracing::error!("Runtime exited: {:?}", result);
            return Ok(());
        }
    }

    shutdown_tx.send(true).ok();
    if let Err(e) = runtime_task.await {
        tracing::error!("Runtime task failed during shutdown: {}", e);
    }

    tracing::info!("👋 breakoutbot stopped");
    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("breakoutbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_settings(settings: &Settings) {
    let cfg = &settings.strategy;
    tracing::info!("📊 Configuration:");
    tracing::info!("  Symbols: {}", settings.symbols.join(", "));
    tracing::info!(
        "  Venues: {} (primary) / {}",
        settings.primary_venue,
        settings.secondary_venue.as_deref().unwrap_or("none")
    );
    tracing::info!("  Poll interval: {}s", settings.poll_interval_secs);
    tracing::info!("  MA window: {}", cfg.ma_window);
    tracing::info!(
        "  Breakout / drop / trailing: {}% / {}% / {}%",
        cfg.breakout_threshold_pct,
        cfg.drop_threshold_pct,
        cfg.trailing_distance_pct
    );
    tracing::info!("  Order size: {}", cfg.order_size);
    tracing::info!("  Arbitrage threshold: {}% net of fees", cfg.arbitrage_threshold_pct);
    for venue in &settings.venues {
        tracing::info!(
            "  {} taker fee: {}%{}",
            venue.name,
            venue.taker_fee_pct,
            if venue.use_order_book { " (order book)" } else { "" }
        );
    }
}

async fn connect_store(redis_url: Option<&str>) -> Arc<dyn PositionStore> {
    let Some(url) = redis_url else {
        tracing::info!("No Redis configured, positions kept in memory");
        return Arc::new(MemoryPositionStore::new());
    };

    match RedisPositionStore::new(url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(
                "Redis unavailable ({}), positions kept in memory and lost on restart",
                e
            );
            Arc::new(MemoryPositionStore::new())
        }
    }
}

/// Read operator commands from stdin until EOF or shutdown
async fn command_loop(
    handler: CommandHandler,
    operator: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Failed to read command: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match handler.handle(&operator, &line).await {
            Ok(reply) => println!("{}", reply),
            Err(e) => println!("❌ {}", e),
        }
    }
}
