pub mod lcd_client;

pub use lcd_client::LcdClient;

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::AppResult;
use crate::marketdata::{Pair, PricePoint};

/// A configured pair together with the denoms and pool the chain knows it by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSpec {
    pub pair: Pair,
    pub pool_id: u64,
    pub base_denom: String,
    pub quote_denom: String,
}

/// Source of spot prices.
///
/// Implementations own their transport and must give up once `timeout` has
/// elapsed. Callers only distinguish success from failure.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn fetch_spot_price(&self, spec: &PairSpec, timeout: Duration)
    -> AppResult<PricePoint>;
}
