use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{BotError, ExchangeError};
use crate::exchange::{Exchange, OrderAck, OrderRequest};
use crate::models::{split_symbol, Decision, DecisionKind, OrderResult, OrderStatus, OrderType, Side};
use crate::settings::ConfigStore;

/// Decision ids remembered for duplicate detection
const EXECUTED_HISTORY: usize = 1024;

/// Bounded retry with exponential backoff, applied to every exchange call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    /// Upper bound on a single call
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            factor: 2,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.base_delay
            .saturating_mul(self.factor.saturating_pow(exponent))
    }
}

enum RetryError {
    /// Every attempt timed out or hit a transient failure
    Exhausted(String),
    /// Non-retryable exchange answer
    Hard(ExchangeError),
}

/// Turns decisions into exchange calls for one symbol
///
/// Owned by a single executor task, so decisions for a symbol are executed
/// one at a time in the order they were emitted.
pub struct OrderExecutor {
    exchanges: HashMap<String, Arc<dyn Exchange>>,
    config: ConfigStore,
    policy: RetryPolicy,
    executed: HashSet<Uuid>,
    /// Insertion order of `executed`, oldest first
    history: VecDeque<Uuid>,
    history_limit: usize,
}

impl OrderExecutor {
    pub fn new(
        exchanges: HashMap<String, Arc<dyn Exchange>>,
        config: ConfigStore,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            exchanges,
            config,
            policy,
            executed: HashSet::new(),
            history: VecDeque::new(),
            history_limit: EXECUTED_HISTORY,
        }
    }

    /// Remember at most `limit` decision ids for duplicate detection
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Record `id`, returning false if it was already executed
    fn remember(&mut self, id: Uuid) -> bool {
        if !self.executed.insert(id) {
            return false;
        }
        self.history.push_back(id);
        while self.history.len() > self.history_limit {
            if let Some(oldest) = self.history.pop_front() {
                self.executed.remove(&oldest);
            }
        }
        true
    }

    /// Build the venue order for a decision
    ///
    /// Buys are placed `limit_offset_pct` below target; trailing and
    /// arbitrage sells at target; defensive exits at market.
    pub fn order_request(decision: &Decision, limit_offset_pct: Decimal) -> crate::Result<OrderRequest> {
        let (order_type, price) = match decision.kind {
            DecisionKind::Enter | DecisionKind::ArbitrageBuy => {
                let limit = decision
                    .target_price
                    .checked_mul(Decimal::ONE - limit_offset_pct / Decimal::ONE_HUNDRED)
                    .ok_or_else(|| {
                        BotError::InvalidInput(format!(
                            "limit price for {} overflows",
                            decision.target_price
                        ))
                    })?;
                (OrderType::Limit, Some(limit))
            }
            DecisionKind::ExitTrailingStop | DecisionKind::ArbitrageSell => {
                (OrderType::Limit, Some(decision.target_price))
            }
            DecisionKind::ExitDefensive => (OrderType::Market, None),
        };

        Ok(OrderRequest {
            client_order_id: decision.id,
            symbol: decision.symbol.clone(),
            side: decision.kind.side(),
            order_type,
            price,
            quantity: decision.quantity,
        })
    }

    /// Execute one decision to a terminal result
    pub async fn execute(&mut self, decision: Decision) -> OrderResult {
        if !self.remember(decision.id) {
            tracing::warn!(id = %decision.id, "Refusing to execute decision twice");
            return OrderResult::failed(
                decision,
                OrderStatus::Rejected,
                "decision already executed",
            );
        }

        let Some(exchange) = self.exchanges.get(&decision.venue).cloned() else {
            let detail = format!("no exchange configured for venue {}", decision.venue);
            return OrderResult::fatal(decision, detail);
        };

        let (base, quote) = match split_symbol(&decision.symbol) {
            Ok((base, quote)) => (base.to_string(), quote.to_string()),
            Err(e) => return OrderResult::fatal(decision, e.to_string()),
        };

        let cfg = self.config.snapshot();
        let request = match Self::order_request(&decision, cfg.limit_offset_pct) {
            Ok(request) => request,
            Err(e) => return OrderResult::failed(decision, OrderStatus::Rejected, e.to_string()),
        };

        let (asset, required) = match request.side {
            Side::Buy => {
                let price = request.price.unwrap_or(decision.target_price);
                match request.quantity.checked_mul(price) {
                    Some(notional) => (quote, notional),
                    None => {
                        let err = BotError::InvalidInput(format!(
                            "notional of {} at {} overflows",
                            request.quantity, price
                        ));
                        tracing::warn!(id = %decision.id, error = %err, "Refusing order");
                        return OrderResult::failed(decision, OrderStatus::Rejected, err.to_string());
                    }
                }
            }
            Side::Sell => (base, request.quantity),
        };

        let available = match self
            .with_retry("balance query", || exchange.get_balance(&asset))
            .await
        {
            Ok(available) => available,
            Err(RetryError::Hard(ExchangeError::Unauthorized(detail))) => {
                return OrderResult::fatal(decision, detail)
            }
            Err(RetryError::Hard(e)) => {
                return OrderResult::failed(decision, OrderStatus::Failed, e.to_string())
            }
            Err(RetryError::Exhausted(detail)) => {
                return OrderResult::failed(
                    decision,
                    OrderStatus::Failed,
                    format!("balance unavailable: {}", detail),
                )
            }
        };

        if available < required {
            let err = BotError::InsufficientBalance {
                required,
                available,
            };
            tracing::warn!(
                id = %decision.id,
                symbol = %decision.symbol,
                asset = %asset,
                error = %err,
                "Skipping order"
            );
            return OrderResult::failed(decision, OrderStatus::InsufficientBalance, err.to_string());
        }

        tracing::info!(
            id = %decision.id,
            symbol = %decision.symbol,
            venue = %decision.venue,
            kind = ?decision.kind,
            order_type = ?request.order_type,
            price = ?request.price,
            quantity = %request.quantity,
            "Submitting order"
        );

        match self
            .with_retry("order submission", || exchange.place_order(&request))
            .await
        {
            Ok(OrderAck {
                order_id,
                fill_price,
            }) => OrderResult::filled(decision, order_id, fill_price),
            Err(RetryError::Hard(ExchangeError::Unauthorized(detail))) => {
                OrderResult::fatal(decision, detail)
            }
            Err(RetryError::Hard(ExchangeError::InsufficientBalance(detail))) => {
                OrderResult::failed(decision, OrderStatus::InsufficientBalance, detail)
            }
            Err(RetryError::Hard(e)) => {
                OrderResult::failed(decision, OrderStatus::Rejected, e.to_string())
            }
            Err(RetryError::Exhausted(detail)) => {
                OrderResult::failed(decision, OrderStatus::TimedOut, detail)
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            match tokio::time::timeout(self.policy.attempt_timeout, op()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        tracing::info!("{} succeeded after {} attempts", what, attempt);
                    }
                    return Ok(value);
                }
                Ok(Err(e)) if e.is_transient() => last_error = e.to_string(),
                Ok(Err(e)) => return Err(RetryError::Hard(e)),
                Err(_) => {
                    last_error = format!(
                        "{} timed out after {:?}",
                        what, self.policy.attempt_timeout
                    )
                }
            }

            if attempt < self.policy.max_attempts {
                let delay = self.policy.backoff(attempt);
                tracing::warn!(
                    "Attempt {}/{} of {} failed: {}. Retrying in {:?}",
                    attempt,
                    self.policy.max_attempts,
                    what,
                    last_error,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(RetryError::Exhausted(last_error))
    }
}
