use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::marketdata::candles::Candle;

/// A base/quote denomination pair, rendered as `base/quote`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for Pair {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('/') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() => {
                Ok(Pair::new(base, quote))
            }
            _ => Err(AppError::Config(format!("invalid pair '{s}', expected base/quote"))),
        }
    }
}

impl TryFrom<String> for Pair {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Pair> for String {
    fn from(pair: Pair) -> Self {
        pair.to_string()
    }
}

/// One observation returned by a single chain query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricePoint {
    pub price: Decimal,
    pub volume: Decimal,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub price: Decimal,
    pub volume: Decimal,
    pub time: DateTime<Utc>,
}

impl From<&PricePoint> for Ticker {
    fn from(point: &PricePoint) -> Self {
        Self {
            price: point.price,
            volume: point.volume,
            time: point.observed_at,
        }
    }
}

/// Everything the store knows about one pair. Entries are immutable once
/// published; a newer observation produces a new entry.
#[derive(Debug, Clone, Default)]
pub struct PairEntry {
    pub ticker: Option<Ticker>,
    pub candle: Option<Candle>,
    pub history: Arc<VecDeque<Candle>>,
}

impl PairEntry {
    /// Folds `point` into a copy of this entry. Returns `None` when the point is
    /// older than the current ticker so tickers never move backwards in time.
    pub fn apply(
        &self,
        point: &PricePoint,
        bucket: Duration,
        history_len: usize,
    ) -> Option<PairEntry> {
        if let Some(ticker) = &self.ticker {
            if point.observed_at < ticker.time {
                return None;
            }
        }

        let mut history = Arc::clone(&self.history);
        let candle = match &self.candle {
            Some(open) if !open.has_elapsed(point.observed_at, bucket) => open.extend(point),
            Some(open) => {
                let sealed = Arc::make_mut(&mut history);
                sealed.push_back(open.clone());
                while sealed.len() > history_len {
                    sealed.pop_front();
                }
                Candle::open_at(point)
            }
            None => Candle::open_at(point),
        };

        Some(PairEntry {
            ticker: Some(Ticker::from(point)),
            candle: Some(candle),
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    fn point(price: Decimal, volume: Decimal, secs: i64) -> PricePoint {
        PricePoint {
            price,
            volume,
            observed_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    const BUCKET: Duration = Duration::from_secs(60);

    #[test]
    fn pair_round_trips_through_its_display_form() {
        let pair: Pair = "uatom/uosmo".parse().unwrap();
        assert_eq!(pair, Pair::new("uatom", "uosmo"));
        assert_eq!(pair.to_string(), "uatom/uosmo");
        assert!("uatom".parse::<Pair>().is_err());
        assert!("/uosmo".parse::<Pair>().is_err());
    }

    #[test]
    fn first_point_opens_a_bucket() {
        let entry = PairEntry::default()
            .apply(&point(dec("12.5"), dec("100"), 0), BUCKET, 4)
            .unwrap();

        let ticker = entry.ticker.unwrap();
        assert_eq!(ticker.price, dec("12.5"));
        assert_eq!(ticker.volume, dec("100"));

        let candle = entry.candle.unwrap();
        assert_eq!(candle.open, dec("12.5"));
        assert_eq!(candle.high, dec("12.5"));
        assert_eq!(candle.low, dec("12.5"));
        assert_eq!(candle.close, dec("12.5"));
        assert!(entry.history.is_empty());
    }

    #[test]
    fn points_inside_the_bucket_extend_the_open_candle() {
        let entry = PairEntry::default()
            .apply(&point(dec("10"), dec("1"), 0), BUCKET, 4)
            .and_then(|e| e.apply(&point(dec("14"), dec("2"), 10), BUCKET, 4))
            .and_then(|e| e.apply(&point(dec("9"), dec("3"), 20), BUCKET, 4))
            .and_then(|e| e.apply(&point(dec("11"), dec("4"), 30), BUCKET, 4))
            .unwrap();

        let candle = entry.candle.unwrap();
        assert_eq!(candle.open, dec("10"));
        assert_eq!(candle.high, dec("14"));
        assert_eq!(candle.low, dec("9"));
        assert_eq!(candle.close, dec("11"));
        assert_eq!(candle.volume, dec("10"));
        assert_eq!(entry.ticker.unwrap().price, dec("11"));
        assert!(entry.history.is_empty());
    }

    #[test]
    fn point_after_the_bucket_seals_the_candle() {
        let opened = PairEntry::default()
            .apply(&point(dec("10"), dec("1"), 0), BUCKET, 4)
            .unwrap();
        let next = opened
            .apply(&point(dec("13"), dec("5"), 61), BUCKET, 4)
            .unwrap();

        assert_eq!(next.history.len(), 1);
        assert_eq!(next.history[0].open, dec("10"));
        assert_eq!(next.history[0].close, dec("10"));

        let candle = next.candle.unwrap();
        assert_eq!(candle.open, dec("13"));
        assert_eq!(candle.volume, dec("5"));
        assert_eq!(candle.bucket_start, Utc.timestamp_opt(1_700_000_061, 0).unwrap());
        // the published entry is untouched
        assert!(opened.history.is_empty());
    }

    #[test]
    fn history_is_bounded() {
        let mut entry = PairEntry::default();
        for i in 0..6 {
            entry = entry
                .apply(&point(Decimal::from(i), dec("1"), i * 61), BUCKET, 3)
                .unwrap();
        }
        assert_eq!(entry.history.len(), 3);
        assert_eq!(entry.history[0].open, Decimal::from(2));
        assert_eq!(entry.history[2].open, Decimal::from(4));
    }

    #[test]
    fn stale_points_are_ignored() {
        let entry = PairEntry::default()
            .apply(&point(dec("10"), dec("1"), 30), BUCKET, 4)
            .unwrap();
        assert!(entry.apply(&point(dec("9"), dec("1"), 10), BUCKET, 4).is_none());
    }
}
