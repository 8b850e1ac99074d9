use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::marketdata::types::PricePoint;

/// OHLCV aggregate for one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub bucket_start: DateTime<Utc>,
}

impl Candle {
    /// Opens a new bucket seeded with `point`.
    pub fn open_at(point: &PricePoint) -> Self {
        Self {
            open: point.price,
            high: point.price,
            low: point.price,
            close: point.price,
            volume: point.volume,
            bucket_start: point.observed_at,
        }
    }

    pub fn extend(&self, point: &PricePoint) -> Self {
        Self {
            open: self.open,
            high: self.high.max(point.price),
            low: self.low.min(point.price),
            close: point.price,
            volume: self.volume + point.volume,
            bucket_start: self.bucket_start,
        }
    }

    pub fn has_elapsed(&self, at: DateTime<Utc>, bucket: Duration) -> bool {
        match (at - self.bucket_start).to_std() {
            Ok(age) => age >= bucket,
            Err(_) => false,
        }
    }
}
