use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BotError;
use crate::Result;

/// Price observed for a symbol on a venue at a point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceSample {
    pub symbol: String,
    pub venue: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Effective prices for a given order size, when the venue exposes depth
    #[serde(default)]
    pub depth: Option<DepthQuote>,
}

/// Volume-weighted prices for trading `quantity` against the order book
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DepthQuote {
    pub quantity: Decimal,
    /// Average price paid walking the asks
    pub buy_price: Decimal,
    /// Average price received walking the bids
    pub sell_price: Decimal,
}

impl DepthQuote {
    /// Walk both sides of a book for `quantity`
    ///
    /// Levels are `(price, size)` pairs, best first. Fails when either side
    /// cannot absorb the whole quantity.
    pub fn from_book(
        quantity: Decimal,
        asks: &[(Decimal, Decimal)],
        bids: &[(Decimal, Decimal)],
    ) -> Result<Self> {
        if quantity <= Decimal::ZERO {
            return Err(BotError::InvalidInput(format!(
                "depth quantity must be positive, got {}",
                quantity
            )));
        }

        Ok(Self {
            quantity,
            buy_price: average_fill(quantity, asks, "buy")?,
            sell_price: average_fill(quantity, bids, "sell")?,
        })
    }
}

fn average_fill(quantity: Decimal, levels: &[(Decimal, Decimal)], side: &str) -> Result<Decimal> {
    let mut remaining = quantity;
    let mut cost = Decimal::ZERO;

    for &(price, size) in levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = size.min(remaining);
        cost = price
            .checked_mul(take)
            .and_then(|notional| cost.checked_add(notional))
            .ok_or_else(|| BotError::InvalidInput(format!("{} side notional overflows", side)))?;
        remaining -= take;
    }

    if remaining > Decimal::ZERO {
        return Err(BotError::InvalidInput(format!(
            "not enough liquidity to {} {}",
            side, quantity
        )));
    }
    Ok(cost / quantity)
}

impl PriceSample {
    pub fn new(
        symbol: impl Into<String>,
        venue: impl Into<String>,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            venue: venue.into(),
            price,
            timestamp,
            depth: None,
        }
    }

    pub fn with_depth(mut self, depth: DepthQuote) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Price to expect when buying: depth-weighted if known, else the ticker
    pub fn buy_price(&self) -> Decimal {
        self.depth.as_ref().map_or(self.price, |d| d.buy_price)
    }

    /// Price to expect when selling: depth-weighted if known, else the ticker
    pub fn sell_price(&self) -> Decimal {
        self.depth.as_ref().map_or(self.price, |d| d.sell_price)
    }
}

/// Split a `BASE-QUOTE` trading pair into its two assets
pub fn split_symbol(symbol: &str) -> Result<(&str, &str)> {
    match symbol.split_once('-') {
        Some((base, quote)) if !base.is_empty() && !quote.is_empty() => Ok((base, quote)),
        _ => Err(BotError::InvalidInput(format!(
            "symbol {} is not of the form BASE-QUOTE",
            symbol
        ))),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
}

/// What a decision asks the executor to do
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DecisionKind {
    Enter,
    ExitTrailingStop,
    ExitDefensive, // price fell through the drop threshold before breakout
    ArbitrageBuy,
    ArbitrageSell,
}

impl DecisionKind {
    pub fn side(&self) -> Side {
        match self {
            DecisionKind::Enter | DecisionKind::ArbitrageBuy => Side::Buy,
            DecisionKind::ExitTrailingStop
            | DecisionKind::ExitDefensive
            | DecisionKind::ArbitrageSell => Side::Sell,
        }
    }

    pub fn is_arbitrage(&self) -> bool {
        matches!(self, DecisionKind::ArbitrageBuy | DecisionKind::ArbitrageSell)
    }
}

/// Immutable order intent emitted by the strategy engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: Uuid,
    pub kind: DecisionKind,
    pub symbol: String,
    pub venue: String,
    pub target_price: Decimal,
    pub quantity: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(
        kind: DecisionKind,
        symbol: impl Into<String>,
        venue: impl Into<String>,
        target_price: Decimal,
        quantity: Decimal,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            symbol: symbol.into(),
            venue: venue.into(),
            target_price,
            quantity,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Filled,
    Rejected,
    TimedOut,
    InsufficientBalance,
    /// Never submitted: balance query kept failing or credentials were refused
    Failed,
}

/// Terminal outcome of executing one decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResult {
    pub decision: Decision,
    pub status: OrderStatus,
    pub order_id: Option<String>,
    pub fill_price: Option<Decimal>,
    pub error: Option<String>,
    pub fatal: bool,
}

impl OrderResult {
    pub fn filled(decision: Decision, order_id: String, fill_price: Decimal) -> Self {
        Self {
            decision,
            status: OrderStatus::Filled,
            order_id: Some(order_id),
            fill_price: Some(fill_price),
            error: None,
            fatal: false,
        }
    }

    pub fn failed(decision: Decision, status: OrderStatus, error: impl Into<String>) -> Self {
        Self {
            decision,
            status,
            order_id: None,
            fill_price: None,
            error: Some(error.into()),
            fatal: false,
        }
    }

    pub fn fatal(decision: Decision, error: impl Into<String>) -> Self {
        Self {
            fatal: true,
            ..Self::failed(decision, OrderStatus::Failed, error)
        }
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionState {
    Flat,
    Entered,
    TrailingActive,
    Closed,
}

/// Position in a symbol opened by a filled entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub venue: String,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub state: PositionState,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Trailing stop bookkeeping, present once the breakout level was reached
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrailingStopState {
    pub position_id: Uuid,
    pub peak_price: Decimal,
    pub activation_price: Decimal,
    pub trailing_distance_pct: Decimal,
}

impl TrailingStopState {
    /// peak × (1 − distance)
    pub fn trigger_price(&self) -> Decimal {
        self.peak_price * (Decimal::ONE - self.trailing_distance_pct / Decimal::ONE_HUNDRED)
    }
}

/// What gets persisted per symbol so trailing stops survive a restart
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionRecord {
    pub position: Position,
    pub trailing: Option<TrailingStopState>,
}
