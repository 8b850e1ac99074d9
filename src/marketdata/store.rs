use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{instrument, warn};

use crate::marketdata::types::{Pair, PairEntry};

/// Latest candle/ticker state per pair.
///
/// Each entry is published as a whole behind an `Arc`, so a reader holding an
/// entry never sees a half-applied update and writers only contend on the
/// shard of the pair they touch.
#[derive(Debug, Default)]
pub struct PriceStore {
    inner: DashMap<Pair, Arc<PairEntry>>,
}

impl PriceStore {
    /// Creates a store with an empty entry for every configured pair.
    pub fn new<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = Pair>,
    {
        let inner = DashMap::new();
        for pair in pairs {
            inner.insert(pair, Arc::new(PairEntry::default()));
        }
        Self { inner }
    }

    pub fn get(&self, pair: &Pair) -> Option<Arc<PairEntry>> {
        self.inner.get(pair).map(|entry| Arc::clone(entry.value()))
    }

    /// Replaces the entry for `pair`. Pairs are fixed at startup; updates for
    /// unknown pairs are dropped and `false` is returned.
    #[instrument(skip(self, entry), fields(pair = %pair))]
    pub fn update(&self, pair: &Pair, entry: impl Into<Arc<PairEntry>>) -> bool {
        match self.inner.get_mut(pair) {
            Some(mut slot) => {
                *slot.value_mut() = entry.into();
                true
            }
            None => {
                warn!("update for unconfigured pair dropped");
                false
            }
        }
    }

    pub fn snapshot(&self) -> BTreeMap<Pair, Arc<PairEntry>> {
        self.inner
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    pub fn contains(&self, pair: &Pair) -> bool {
        self.inner.contains_key(pair)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
