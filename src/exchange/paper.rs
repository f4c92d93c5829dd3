use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Exchange, OrderAck, OrderRequest};
use crate::error::ExchangeError;
use crate::execution::PriceFeed;
use crate::models::{split_symbol, OrderType, Side};

/// Simulated venue filling every order immediately against local balances
///
/// Limit orders fill at their limit price. Market orders fill at the current
/// ticker of the attached feed and are rejected when there is none.
pub struct PaperExchange {
    venue: String,
    feed: Option<Arc<dyn PriceFeed>>,
    book: Mutex<Book>,
}

#[derive(Default)]
struct Book {
    balances: HashMap<String, Decimal>,
    fills: HashMap<Uuid, OrderAck>,
    next_order: u64,
}

impl PaperExchange {
    pub fn new(venue: impl Into<String>, balances: HashMap<String, Decimal>) -> Self {
        Self {
            venue: venue.into(),
            feed: None,
            book: Mutex::new(Book {
                balances,
                ..Default::default()
            }),
        }
    }

    /// Price market orders off a live ticker
    pub fn with_feed(mut self, feed: Arc<dyn PriceFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub async fn balances(&self) -> HashMap<String, Decimal> {
        self.book.lock().await.balances.clone()
    }

    async fn fill_price(&self, order: &OrderRequest) -> Result<Decimal, ExchangeError> {
        match (order.order_type, order.price) {
            (OrderType::Limit, Some(price)) => Ok(price),
            (OrderType::Limit, None) => Err(ExchangeError::Rejected(
                "limit order without a price".into(),
            )),
            (OrderType::Market, _) => {
                let Some(feed) = &self.feed else {
                    return Err(ExchangeError::Rejected(format!(
                        "no reference price for market order on {}",
                        order.symbol
                    )));
                };
                let sample = feed
                    .poll(&order.symbol)
                    .await
                    .map_err(|e| ExchangeError::Network(e.to_string()))?;
                Ok(sample.price)
            }
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn venue(&self) -> &str {
        &self.venue
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        let book = self.book.lock().await;
        Ok(book.balances.get(asset).copied().unwrap_or(Decimal::ZERO))
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        if let Some(ack) = self.book.lock().await.fills.get(&order.client_order_id) {
            tracing::debug!(
                venue = %self.venue,
                client_order_id = %order.client_order_id,
                "Duplicate submission, returning original fill"
            );
            return Ok(ack.clone());
        }

        if order.quantity <= Decimal::ZERO {
            return Err(ExchangeError::Rejected(format!(
                "quantity must be positive, got {}",
                order.quantity
            )));
        }

        let (base, quote) =
            split_symbol(&order.symbol).map_err(|e| ExchangeError::Rejected(e.to_string()))?;
        let price = self.fill_price(order).await?;
        let notional = price.checked_mul(order.quantity).ok_or_else(|| {
            ExchangeError::Rejected(format!("notional of {} at {} overflows", order.quantity, price))
        })?;

        let mut book = self.book.lock().await;
        if let Some(ack) = book.fills.get(&order.client_order_id) {
            return Ok(ack.clone());
        }

        let (debit_asset, debit, credit_asset, credit) = match order.side {
            Side::Buy => (quote, notional, base, order.quantity),
            Side::Sell => (base, order.quantity, quote, notional),
        };

        let available = book.balances.get(debit_asset).copied().unwrap_or(Decimal::ZERO);
        if available < debit {
            return Err(ExchangeError::InsufficientBalance(format!(
                "{} {} needed, {} available",
                debit, debit_asset, available
            )));
        }

        let held = book.balances.get(credit_asset).copied().unwrap_or(Decimal::ZERO);
        let credited = held.checked_add(credit).ok_or_else(|| {
            ExchangeError::Rejected(format!("{} balance would overflow", credit_asset))
        })?;

        *book.balances.entry(debit_asset.to_string()).or_default() -= debit;
        book.balances.insert(credit_asset.to_string(), credited);

        book.next_order += 1;
        let ack = OrderAck {
            order_id: format!("paper-{}-{}", self.venue, book.next_order),
            fill_price: price,
        };
        book.fills.insert(order.client_order_id, ack.clone());

        tracing::info!(
            venue = %self.venue,
            symbol = %order.symbol,
            side = ?order.side,
            quantity = %order.quantity,
            price = %price,
            order_id = %ack.order_id,
            "Paper fill"
        );

        Ok(ack)
    }
}
