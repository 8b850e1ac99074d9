use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chain::PairSpec;
use crate::engine::AggregatorConfig;
use crate::errors::{AppError, AppResult};
use crate::hub::HubConfig;
use crate::marketdata::Pair;
use crate::server::ServerConfig;
use crate::utils::ibc::ibc_denom;
use crate::utils::time::require_duration;

const ENV_PREFIX: &str = "OSMOSIS_FEED";
const MIN_MISSED_PONG_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
    #[serde(default = "TelemetryConfig::default_format")]
    pub format: LogFormat,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_format() -> LogFormat {
        LogFormat::Text
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            format: Self::default_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "ServerSettings::default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "ServerSettings::default_timeout")]
    pub read_timeout: String,
    #[serde(default = "ServerSettings::default_timeout")]
    pub write_timeout: String,
    #[serde(default = "ServerSettings::default_shutdown_grace")]
    pub shutdown_grace: String,
}

impl ServerSettings {
    fn default_listen_addr() -> String {
        "localhost:8080".into()
    }

    fn default_timeout() -> String {
        "20s".into()
    }

    fn default_shutdown_grace() -> String {
        "15s".into()
    }

    /// Blank values fall back to their defaults.
    fn fill_blanks(&mut self) {
        if self.listen_addr.trim().is_empty() {
            self.listen_addr = Self::default_listen_addr();
        }
        if self.read_timeout.trim().is_empty() {
            self.read_timeout = Self::default_timeout();
        }
        if self.write_timeout.trim().is_empty() {
            self.write_timeout = Self::default_timeout();
        }
        if self.shutdown_grace.trim().is_empty() {
            self.shutdown_grace = Self::default_shutdown_grace();
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            read_timeout: Self::default_timeout(),
            write_timeout: Self::default_timeout(),
            shutdown_grace: Self::default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    #[serde(default = "HubSettings::default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "HubSettings::default_ping_interval")]
    pub ping_interval: String,
    #[serde(default = "HubSettings::default_missed_pong_threshold")]
    pub missed_pong_threshold: u32,
}

impl HubSettings {
    fn default_outbound_queue() -> usize {
        256
    }

    fn default_ping_interval() -> String {
        "15s".into()
    }

    fn default_missed_pong_threshold() -> u32 {
        3
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbound_queue: Self::default_outbound_queue(),
            ping_interval: Self::default_ping_interval(),
            missed_pong_threshold: Self::default_missed_pong_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorSettings {
    #[serde(default = "AggregatorSettings::default_tick_interval")]
    pub tick_interval: String,
    #[serde(default = "AggregatorSettings::default_query_timeout")]
    pub query_timeout: String,
    #[serde(default = "AggregatorSettings::default_candle_interval")]
    pub candle_interval: String,
    #[serde(default = "AggregatorSettings::default_history_len")]
    pub history_len: usize,
    #[serde(default = "AggregatorSettings::default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "AggregatorSettings::default_shutdown_grace")]
    pub shutdown_grace: String,
}

impl AggregatorSettings {
    fn default_tick_interval() -> String {
        "1s".into()
    }

    fn default_query_timeout() -> String {
        "800ms".into()
    }

    fn default_candle_interval() -> String {
        "60s".into()
    }

    fn default_history_len() -> usize {
        120
    }

    fn default_max_concurrency() -> usize {
        8
    }

    fn default_shutdown_grace() -> String {
        "5s".into()
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            tick_interval: Self::default_tick_interval(),
            query_timeout: Self::default_query_timeout(),
            candle_interval: Self::default_candle_interval(),
            history_len: Self::default_history_len(),
            max_concurrency: Self::default_max_concurrency(),
            shutdown_grace: Self::default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainSettings {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub base: String,
    pub quote: String,
    pub pool_id: u64,
    #[serde(default)]
    pub base_channel: Option<String>,
    #[serde(default)]
    pub quote_channel: Option<String>,
}

impl PairConfig {
    pub fn pair(&self) -> Pair {
        Pair::new(self.base.clone(), self.quote.clone())
    }

    /// Resolves the denoms the chain knows this pair by. Assets that arrive
    /// over IBC are queried by their voucher denom.
    pub fn resolve(&self) -> AppResult<PairSpec> {
        if self.base.is_empty() || self.quote.is_empty() {
            return Err(AppError::Config("pair base and quote must be set".into()));
        }
        let base_denom = match &self.base_channel {
            Some(channel) => ibc_denom(channel, &self.base)?,
            None => self.base.clone(),
        };
        let quote_denom = match &self.quote_channel {
            Some(channel) => ibc_denom(channel, &self.quote)?,
            None => self.quote.clone(),
        };
        Ok(PairSpec {
            pair: self.pair(),
            pool_id: self.pool_id,
            base_denom,
            quote_denom,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub aggregator: AggregatorSettings,
    #[serde(default)]
    pub chain: ChainSettings,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

impl Settings {
    pub fn load_from(path: impl AsRef<Path>) -> AppResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));
        Self::finish(builder.build()?.try_deserialize()?)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml));
        Self::finish(builder.build()?.try_deserialize()?)
    }

    fn finish(mut settings: Settings) -> AppResult<Self> {
        settings.server.fill_blanks();
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        self.server_config()?;
        self.hub_config()?;
        self.aggregator_config()?;
        self.pair_specs()?;
        Ok(())
    }

    pub fn server_config(&self) -> AppResult<ServerConfig> {
        let server = &self.server;
        if server.listen_addr.trim().is_empty() {
            return Err(AppError::Config("server.listen_addr must be set".into()));
        }
        Ok(ServerConfig {
            listen_addr: server.listen_addr.clone(),
            read_timeout: require_duration("server.read_timeout", &server.read_timeout)?,
            write_timeout: require_duration("server.write_timeout", &server.write_timeout)?,
            shutdown_grace: require_duration("server.shutdown_grace", &server.shutdown_grace)?,
        })
    }

    pub fn hub_config(&self) -> AppResult<HubConfig> {
        let hub = &self.hub;
        if hub.outbound_queue == 0 {
            return Err(AppError::Config("hub.outbound_queue must be > 0".into()));
        }
        // with a single interval the deadline lands on the first ping itself
        if hub.missed_pong_threshold < MIN_MISSED_PONG_THRESHOLD {
            return Err(AppError::Config(format!(
                "hub.missed_pong_threshold must be at least {MIN_MISSED_PONG_THRESHOLD}"
            )));
        }
        Ok(HubConfig {
            outbound_queue: hub.outbound_queue,
            ping_interval: require_duration("hub.ping_interval", &hub.ping_interval)?,
            missed_pong_threshold: hub.missed_pong_threshold,
            write_timeout: require_duration("server.write_timeout", &self.server.write_timeout)?,
        })
    }

    pub fn aggregator_config(&self) -> AppResult<AggregatorConfig> {
        let agg = &self.aggregator;
        let tick_interval = require_duration("aggregator.tick_interval", &agg.tick_interval)?;
        let query_timeout = require_duration("aggregator.query_timeout", &agg.query_timeout)?;
        if query_timeout >= tick_interval {
            return Err(AppError::Config(
                "aggregator.query_timeout must be smaller than aggregator.tick_interval".into(),
            ));
        }
        if agg.history_len == 0 {
            return Err(AppError::Config("aggregator.history_len must be > 0".into()));
        }
        if agg.max_concurrency == 0 {
            return Err(AppError::Config(
                "aggregator.max_concurrency must be > 0".into(),
            ));
        }
        Ok(AggregatorConfig {
            tick_interval,
            query_timeout,
            candle_interval: require_duration(
                "aggregator.candle_interval",
                &agg.candle_interval,
            )?,
            history_len: agg.history_len,
            max_concurrency: agg.max_concurrency,
            shutdown_grace: require_duration("aggregator.shutdown_grace", &agg.shutdown_grace)?,
        })
    }

    pub fn pair_specs(&self) -> AppResult<Vec<PairSpec>> {
        if self.pairs.is_empty() {
            return Err(AppError::Config("at least one pair must be configured".into()));
        }
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.pairs.len());
        for cfg in &self.pairs {
            let spec = cfg.resolve()?;
            if !seen.insert(spec.pair.clone()) {
                return Err(AppError::Config(format!("duplicate pair {}", spec.pair)));
            }
            specs.push(spec);
        }
        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const MINIMAL: &str = r#"
[[pairs]]
base = "uatom"
quote = "uosmo"
pool_id = 1
"#;

    #[test]
    fn server_defaults_apply() {
        let settings = Settings::from_toml(MINIMAL).unwrap();
        settings.validate().unwrap();

        let server = settings.server_config().unwrap();
        assert_eq!(server.listen_addr, "localhost:8080");
        assert_eq!(server.read_timeout, Duration::from_secs(20));
        assert_eq!(server.write_timeout, Duration::from_secs(20));
        assert_eq!(settings.telemetry.format, LogFormat::Text);
    }

    #[test]
    fn partial_server_section_keeps_other_defaults() {
        let toml = format!(
            r#"
[server]
listen_addr = "0.0.0.0:9999"
read_timeout = "20s"
write_timeout = ""
{MINIMAL}"#
        );
        let settings = Settings::from_toml(&toml).unwrap();
        assert_eq!(settings.server.listen_addr, "0.0.0.0:9999");
        assert_eq!(settings.server.write_timeout, "20s");
        assert_eq!(settings.server.read_timeout, "20s");
    }

    #[test]
    fn query_timeout_must_fit_inside_tick() {
        let toml = format!(
            r#"
[aggregator]
tick_interval = "500ms"
query_timeout = "500ms"
{MINIMAL}"#
        );
        let err = Settings::from_toml(&toml).unwrap().validate().unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn bad_durations_are_rejected() {
        let toml = format!(
            r#"
[hub]
ping_interval = "often"
{MINIMAL}"#
        );
        assert!(Settings::from_toml(&toml).unwrap().validate().is_err());
    }

    #[test]
    fn keepalive_needs_room_for_a_pong() {
        for threshold in [0, 1] {
            let toml = format!(
                r#"
[hub]
missed_pong_threshold = {threshold}
{MINIMAL}"#
            );
            let err = Settings::from_toml(&toml).unwrap().validate().unwrap_err();
            assert!(err.to_string().contains("missed_pong_threshold"));
        }

        let toml = format!(
            r#"
[hub]
missed_pong_threshold = 2
{MINIMAL}"#
        );
        let hub = Settings::from_toml(&toml).unwrap().hub_config().unwrap();
        assert_eq!(hub.keepalive_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn pairs_are_required_and_unique() {
        assert!(Settings::from_toml("").unwrap().validate().is_err());

        let toml = format!("{MINIMAL}{MINIMAL}");
        let err = Settings::from_toml(&toml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("duplicate pair"));
    }

    #[test]
    fn ibc_assets_resolve_to_voucher_denoms() {
        let toml = r#"
[[pairs]]
base = "uatom"
quote = "uosmo"
pool_id = 1
base_channel = "channel-0"
"#;
        let specs = Settings::from_toml(toml).unwrap().pair_specs().unwrap();
        assert_eq!(specs[0].pair.to_string(), "uatom/uosmo");
        assert_eq!(
            specs[0].base_denom,
            "ibc/27394FB092D2ECCD56123C74F36E4C1F926001CEADA9CA97EA622B25F41E5EB2"
        );
        assert_eq!(specs[0].quote_denom, "uosmo");
    }
}
