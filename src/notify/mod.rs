use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::BotError;
use crate::models::{Decision, OrderResult};
use crate::settings::ConfigSnapshot;
use crate::Result;

/// Something the operator should hear about
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DecisionEmitted(Decision),
    OrderFilled(OrderResult),
    OrderFailed(OrderResult),
    ConfigChanged {
        version: u64,
        snapshot: ConfigSnapshot,
    },
    SymbolPaused {
        symbol: String,
        reason: String,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::DecisionEmitted(d) => write!(
                f,
                "{:?} {} {} on {} at {} ({})",
                d.kind, d.quantity, d.symbol, d.venue, d.target_price, d.reason
            ),
            Event::OrderFilled(r) => write!(
                f,
                "Filled {:?} {} {} on {} at {} [{}]",
                r.decision.kind,
                r.decision.quantity,
                r.decision.symbol,
                r.decision.venue,
                r.fill_price.unwrap_or(r.decision.target_price),
                r.order_id.as_deref().unwrap_or("-")
            ),
            Event::OrderFailed(r) => write!(
                f,
                "{:?} {:?} {} on {}: {}",
                r.status,
                r.decision.kind,
                r.decision.symbol,
                r.decision.venue,
                r.error.as_deref().unwrap_or("no detail")
            ),
            Event::ConfigChanged { version, snapshot } => write!(
                f,
                "Config v{}: window {}, breakout {}%, drop {}%, trailing {}%, offset {}%, size {}, arbitrage {}%",
                version,
                snapshot.ma_window,
                snapshot.breakout_threshold_pct,
                snapshot.drop_threshold_pct,
                snapshot.trailing_distance_pct,
                snapshot.limit_offset_pct,
                snapshot.order_size,
                snapshot.arbitrage_threshold_pct
            ),
            Event::SymbolPaused { symbol, reason } => {
                write!(f, "Trading paused for {}: {}", symbol, reason)
            }
        }
    }
}

/// Outbound channel to the operator
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &Event) -> Result<()>;
}

/// Writes events to the log
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, event: &Event) -> Result<()> {
        match event {
            Event::OrderFailed(_) | Event::SymbolPaused { .. } => {
                tracing::warn!(target: "breakoutbot::notify", "{}", event)
            }
            _ => tracing::info!(target: "breakoutbot::notify", "{}", event),
        }
        Ok(())
    }
}

/// Forwards events to a bounded channel, e.g. a chat transport task
///
/// Never blocks: a full channel drops the event.
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn notify(&self, event: &Event) -> Result<()> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                BotError::NetworkFailure("notification channel full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                BotError::NetworkFailure("notification channel closed".into())
            }
        })
    }
}

/// Fan-out to every configured sink
///
/// Sink failures are logged and otherwise ignored.
#[derive(Clone, Default)]
pub struct Notifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    pub async fn send(&self, event: Event) {
        for sink in &self.sinks {
            if let Err(e) = sink.notify(&event).await {
                tracing::error!("Notification failed: {}", e);
            }
        }
    }
}
