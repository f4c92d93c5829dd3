use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use crate::error::BotError;
use crate::Result;

/// Largest order size accepted, in base units
pub const MAX_ORDER_SIZE: u64 = 1_000_000_000;

/// Strategy thresholds read once per evaluation cycle
///
/// Percentages are expressed in percent (`10` means 10%).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConfigSnapshot {
    pub ma_window: usize,
    pub breakout_threshold_pct: Decimal,
    pub drop_threshold_pct: Decimal,
    pub trailing_distance_pct: Decimal,
    pub limit_offset_pct: Decimal,
    pub order_size: Decimal,
    pub arbitrage_threshold_pct: Decimal,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            ma_window: 10,
            breakout_threshold_pct: Decimal::from(10),
            drop_threshold_pct: Decimal::from(2),
            trailing_distance_pct: Decimal::from(2),
            limit_offset_pct: Decimal::ONE,
            order_size: Decimal::from(10),
            arbitrage_threshold_pct: Decimal::new(5, 1), // 0.5%
        }
    }
}

impl ConfigSnapshot {
    pub fn validate(&self) -> Result<()> {
        if self.ma_window == 0 {
            return Err(BotError::InvalidInput("ma_window must be at least 1".into()));
        }

        let pcts = [
            ("breakout_threshold_pct", self.breakout_threshold_pct),
            ("drop_threshold_pct", self.drop_threshold_pct),
            ("trailing_distance_pct", self.trailing_distance_pct),
            ("limit_offset_pct", self.limit_offset_pct),
            ("arbitrage_threshold_pct", self.arbitrage_threshold_pct),
        ];
        for (name, value) in pcts {
            if value <= Decimal::ZERO || value >= Decimal::ONE_HUNDRED {
                return Err(BotError::InvalidInput(format!(
                    "{} must be in (0, 100), got {}",
                    name, value
                )));
            }
        }

        if self.order_size <= Decimal::ZERO || self.order_size > Decimal::from(MAX_ORDER_SIZE) {
            return Err(BotError::InvalidInput(format!(
                "order_size must be in (0, {}], got {}",
                MAX_ORDER_SIZE, self.order_size
            )));
        }

        Ok(())
    }
}

/// Live configuration shared between the command surface and the engines
///
/// Writers build a whole new snapshot and swap the `Arc`; readers clone the
/// `Arc` and never observe a half-applied update.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<Versioned>>,
}

#[derive(Debug)]
struct Versioned {
    version: u64,
    snapshot: Arc<ConfigSnapshot>,
}

impl ConfigStore {
    pub fn new(initial: ConfigSnapshot) -> Result<Self> {
        initial.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Versioned {
                version: 1,
                snapshot: Arc::new(initial),
            })),
        })
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        match self.inner.read() {
            Ok(guard) => guard.snapshot.clone(),
            // A panicked writer never leaves a partial snapshot behind
            Err(poisoned) => poisoned.into_inner().snapshot.clone(),
        }
    }

    pub fn version(&self) -> u64 {
        match self.inner.read() {
            Ok(guard) => guard.version,
            Err(poisoned) => poisoned.into_inner().version,
        }
    }

    /// Validate and atomically replace the snapshot, returning the new version
    pub fn replace(&self, snapshot: ConfigSnapshot) -> Result<u64> {
        snapshot.validate()?;

        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.version += 1;
        guard.snapshot = Arc::new(snapshot);

        tracing::info!(version = guard.version, "Configuration snapshot replaced");
        Ok(guard.version)
    }

    /// Derive a new snapshot from the current one and swap it in
    ///
    /// The read-modify-write happens under the write lock so two concurrent
    /// updates cannot lose each other's fields. Returns the new version and
    /// snapshot.
    pub fn update<F>(&self, f: F) -> Result<(u64, Arc<ConfigSnapshot>)>
    where
        F: FnOnce(&mut ConfigSnapshot),
    {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut next = (*guard.snapshot).clone();
        f(&mut next);
        next.validate()?;

        guard.version += 1;
        guard.snapshot = Arc::new(next);
        tracing::info!(version = guard.version, "Configuration snapshot updated");

        Ok((guard.version, guard.snapshot.clone()))
    }
}
