// Order placement capability
pub mod paper;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::models::{OrderType, Side};

pub use paper::PaperExchange;

/// Order as handed to a venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Decision id, reused on every resubmission so the venue can deduplicate
    pub client_order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    /// Limit price; `None` for market orders
    pub price: Option<Decimal>,
    pub quantity: Decimal,
}

/// Venue acknowledgement of a filled order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub fill_price: Decimal,
}

/// Authenticated trading access to one venue
///
/// Implementations must treat a repeated `client_order_id` as the same order.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn venue(&self) -> &str;

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExchangeError>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError>;
}
