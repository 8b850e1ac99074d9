use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{info, instrument};

use crate::chain::{ChainClient, PairSpec};
use crate::errors::{AppError, AppResult};
use crate::marketdata::PricePoint;
use crate::utils::time::now;

const NODE_INFO_PATH: &str = "/cosmos/base/tendermint/v1beta1/node_info";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct SpotPriceResponse {
    spot_price: String,
}

/// Spot-price client for the chain's REST gateway.
#[derive(Clone)]
pub struct LcdClient {
    http: reqwest::Client,
    endpoint: String,
}

impl LcdClient {
    /// Builds the client and makes sure the node answers before returning.
    #[instrument(skip(headers))]
    pub async fn connect(endpoint: &str, headers: &BTreeMap<String, String>) -> AppResult<Self> {
        let endpoint = normalize_endpoint(endpoint)?;
        let http = reqwest::Client::builder()
            .default_headers(header_map(headers)?)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        let client = Self { http, endpoint };
        client.probe().await?;
        info!(endpoint = %client.endpoint, "connected to chain node");
        Ok(client)
    }

    async fn probe(&self) -> AppResult<()> {
        self.http
            .get(format!("{}{NODE_INFO_PATH}", self.endpoint))
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await
            .map_err(|e| AppError::Chain(format!("failed to reach {}: {e}", self.endpoint)))?
            .error_for_status()
            .map_err(|e| AppError::Chain(e.to_string()))?;
        Ok(())
    }

    fn spot_price_url(&self, spec: &PairSpec) -> String {
        format!(
            "{}/osmosis/gamm/v1beta1/pools/{}/prices",
            self.endpoint, spec.pool_id
        )
    }
}

#[async_trait]
impl ChainClient for LcdClient {
    #[instrument(skip(self), fields(pair = %spec.pair))]
    async fn fetch_spot_price(&self, spec: &PairSpec, timeout: Duration) -> AppResult<PricePoint> {
        let request = self
            .http
            .get(self.spot_price_url(spec))
            .query(&[
                ("base_asset_denom", spec.base_denom.as_str()),
                ("quote_asset_denom", spec.quote_denom.as_str()),
            ])
            .timeout(timeout)
            .send();

        let response = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| AppError::Timeout(timeout))??
            .error_for_status()?;
        let body: SpotPriceResponse = response.json().await?;
        let price = parse_price(&body.spot_price)?;

        // spot price queries carry no traded volume
        Ok(PricePoint {
            price,
            volume: Decimal::ZERO,
            observed_at: now(),
        })
    }
}

fn normalize_endpoint(endpoint: &str) -> AppResult<String> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        return Err(AppError::Config("chain endpoint must be set".into()));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.to_string())
    } else {
        Ok(format!("http://{endpoint}"))
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> AppResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| AppError::Config(format!("invalid header name {key}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AppError::Config(format!("invalid value for header {key}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn parse_price(raw: &str) -> AppResult<Decimal> {
    raw.trim()
        .parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(raw.trim()))
        .map_err(|e| AppError::Chain(format!("invalid spot price '{raw}': {e}")))
}
