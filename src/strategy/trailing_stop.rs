use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::BotError;
use crate::models::{
    Decision, DecisionKind, OrderResult, Position, PositionRecord, PositionState,
    TrailingStopState,
};
use crate::settings::ConfigSnapshot;
use crate::Result;

/// Outcome of feeding one price to a tracker
#[derive(Debug, Default, PartialEq)]
pub struct TrailingUpdate {
    pub decision: Option<Decision>,
    /// Something worth persisting changed (state transition or new peak)
    pub changed: bool,
}

/// Trailing stop state machine for a single position
///
/// Constructing a tracker is the Flat → Entered transition. Closed is
/// terminal: a later re-entry gets a fresh tracker.
#[derive(Debug, Clone)]
pub struct TrailingStopTracker {
    position: Position,
    trailing: Option<TrailingStopState>,
    pending_exit: Option<Uuid>,
}

impl TrailingStopTracker {
    /// Open a position after its entry order filled
    pub fn open(
        symbol: impl Into<String>,
        venue: impl Into<String>,
        entry_price: Decimal,
        quantity: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Result<Self> {
        if entry_price <= Decimal::ZERO || quantity <= Decimal::ZERO {
            return Err(BotError::InvalidInput(format!(
                "cannot open position at {} x {}",
                entry_price, quantity
            )));
        }

        Ok(Self {
            position: Position {
                id: Uuid::new_v4(),
                symbol: symbol.into(),
                venue: venue.into(),
                entry_price,
                quantity,
                state: PositionState::Entered,
                opened_at: Some(opened_at),
            },
            trailing: None,
            pending_exit: None,
        })
    }

    /// Rebuild a tracker from a persisted record
    pub fn restore(record: PositionRecord) -> Result<Self> {
        match record.position.state {
            PositionState::Entered | PositionState::TrailingActive => {}
            state => {
                return Err(BotError::InvalidInput(format!(
                    "cannot resume a position in state {:?}",
                    state
                )))
            }
        }
        if record.position.state == PositionState::TrailingActive && record.trailing.is_none() {
            return Err(BotError::InvalidInput(
                "trailing position without trailing state".into(),
            ));
        }

        Ok(Self {
            position: record.position,
            trailing: record.trailing,
            pending_exit: None,
        })
    }

    /// Feed the latest price for the position's symbol
    pub fn on_price(&mut self, price: Decimal, cfg: &ConfigSnapshot) -> TrailingUpdate {
        let mut update = TrailingUpdate::default();

        match self.position.state {
            PositionState::Entered => {
                // An entry too large to scale can never activate
                let activation = self
                    .position
                    .entry_price
                    .checked_mul(Decimal::ONE + cfg.breakout_threshold_pct / Decimal::ONE_HUNDRED)
                    .filter(|activation| price >= *activation);

                if let Some(activation) = activation {
                    self.position.state = PositionState::TrailingActive;
                    self.trailing = Some(TrailingStopState {
                        position_id: self.position.id,
                        peak_price: price,
                        activation_price: activation,
                        trailing_distance_pct: cfg.trailing_distance_pct,
                    });
                    update.changed = true;

                    tracing::info!(
                        symbol = %self.position.symbol,
                        price = %price,
                        activation = %activation,
                        "Trailing stop activated"
                    );
                    return update;
                }

                let floor = self.position.entry_price
                    * (Decimal::ONE - cfg.drop_threshold_pct / Decimal::ONE_HUNDRED);

                if price < floor && self.pending_exit.is_none() {
                    update.decision = Some(self.exit(
                        DecisionKind::ExitDefensive,
                        price,
                        format!(
                            "price {} fell below {} ({}% under entry {})",
                            price, floor, cfg.drop_threshold_pct, self.position.entry_price
                        ),
                    ));
                }
            }

            PositionState::TrailingActive => {
                let Some(trailing) = self.trailing.as_mut() else {
                    return update;
                };

                // Ratchet: the peak only ever moves up
                if price > trailing.peak_price {
                    trailing.peak_price = price;
                    update.changed = true;
                }
                if trailing.trailing_distance_pct != cfg.trailing_distance_pct {
                    trailing.trailing_distance_pct = cfg.trailing_distance_pct;
                    update.changed = true;
                }

                let trigger = trailing.trigger_price();
                let peak = trailing.peak_price;

                if price <= trigger && self.pending_exit.is_none() {
                    update.decision = Some(self.exit(
                        DecisionKind::ExitTrailingStop,
                        price,
                        format!(
                            "price {} retraced to trigger {} from peak {}",
                            price, trigger, peak
                        ),
                    ));
                }
            }

            PositionState::Flat | PositionState::Closed => {}
        }

        update
    }

    fn exit(&mut self, kind: DecisionKind, price: Decimal, reason: String) -> Decision {
        let decision = Decision::new(
            kind,
            self.position.symbol.clone(),
            self.position.venue.clone(),
            price,
            self.position.quantity,
            reason,
        );
        self.pending_exit = Some(decision.id);

        tracing::info!(
            symbol = %self.position.symbol,
            kind = ?kind,
            price = %price,
            "Exit triggered"
        );

        decision
    }

    /// Apply the outcome of this tracker's exit order
    ///
    /// Returns true when the result belonged to the pending exit. A fill closes
    /// the position; any failure re-arms the exit for the next tick.
    pub fn on_exit_result(&mut self, result: &OrderResult) -> bool {
        if self.pending_exit != Some(result.decision.id) {
            return false;
        }
        self.pending_exit = None;

        if result.is_filled() {
            self.position.state = PositionState::Closed;
            tracing::info!(
                symbol = %self.position.symbol,
                exit_price = ?result.fill_price,
                "Position closed"
            );
        } else {
            tracing::warn!(
                symbol = %self.position.symbol,
                status = ?result.status,
                "Exit order failed, position stays open"
            );
        }
        true
    }

    pub fn state(&self) -> PositionState {
        self.position.state
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn trailing(&self) -> Option<&TrailingStopState> {
        self.trailing.as_ref()
    }

    pub fn has_pending_exit(&self) -> bool {
        self.pending_exit.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.position.state == PositionState::Closed
    }

    /// Snapshot for persistence; `None` once closed
    pub fn record(&self) -> Option<PositionRecord> {
        if self.is_closed() {
            return None;
        }
        Some(PositionRecord {
            position: self.position.clone(),
            trailing: self.trailing.clone(),
        })
    }
}
