use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::chain::{ChainClient, PairSpec};
use crate::errors::{AppError, AppResult};
use crate::hub::ConnectionHub;
use crate::marketdata::{Pair, PairEntry, PricePoint, PriceStore};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub tick_interval: Duration,
    pub query_timeout: Duration,
    pub candle_interval: Duration,
    pub history_len: usize,
    pub max_concurrency: usize,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub updated: usize,
    pub failed: usize,
    pub stale: usize,
    pub delivered: usize,
}

/// Polls the chain for every configured pair on a fixed interval, folds the
/// results into the store and hands changed pairs to the hub.
pub struct Aggregator {
    client: Arc<dyn ChainClient>,
    store: Arc<PriceStore>,
    hub: Arc<ConnectionHub>,
    pairs: Vec<PairSpec>,
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<PriceStore>,
        hub: Arc<ConnectionHub>,
        pairs: Vec<PairSpec>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            client,
            store,
            hub,
            pairs,
            config,
        }
    }

    /// Ticks until `shutdown` fires. Ticks never overlap: one that overruns
    /// the interval causes the missed ticks to be skipped.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            pairs = self.pairs.len(),
            interval = ?self.config.tick_interval,
            "aggregator started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let started = Instant::now();
            let tick = self.tick();
            tokio::pin!(tick);
            let report = tokio::select! {
                report = &mut tick => report,
                _ = shutdown.cancelled() => {
                    match tokio::time::timeout(self.config.shutdown_grace, &mut tick).await {
                        Ok(report) => debug!(?report, "in-flight tick finished during shutdown"),
                        Err(_) => warn!("abandoning in-flight tick after shutdown grace period"),
                    }
                    break;
                }
            };

            let elapsed = started.elapsed();
            if elapsed > self.config.tick_interval {
                warn!(?elapsed, "tick overran its interval, skipping missed ticks");
            }
            debug!(
                updated = report.updated,
                failed = report.failed,
                stale = report.stale,
                delivered = report.delivered,
                "tick complete"
            );
        }

        info!("aggregator stopped");
    }

    /// Runs one polling cycle across all pairs.
    pub async fn tick(&self) -> TickReport {
        let timeout = self.config.query_timeout;
        let mut results = stream::iter(self.pairs.iter().cloned())
            .map(|spec| {
                let client = Arc::clone(&self.client);
                async move {
                    let result = fetch(client.as_ref(), &spec, timeout).await;
                    (spec, result)
                }
            })
            .buffer_unordered(self.config.max_concurrency);

        let mut report = TickReport::default();
        let mut changed = Vec::new();
        while let Some((spec, result)) = results.next().await {
            match result {
                Ok(point) => match self.apply(&spec.pair, &point) {
                    Some(entry) => {
                        report.updated += 1;
                        changed.push((spec.pair, entry));
                    }
                    None => report.stale += 1,
                },
                Err(e) => {
                    report.failed += 1;
                    warn!(pair = %spec.pair, error = %e, "price query failed");
                }
            }
        }

        if !changed.is_empty() {
            report.delivered = self.hub.broadcast(&changed).delivered;
        }
        report
    }

    fn apply(&self, pair: &Pair, point: &PricePoint) -> Option<Arc<PairEntry>> {
        let current = self.store.get(pair)?;
        let next = Arc::new(current.apply(
            point,
            self.config.candle_interval,
            self.config.history_len,
        )?);
        self.store
            .update(pair, Arc::clone(&next))
            .then_some(next)
    }
}

async fn fetch(client: &dyn ChainClient, spec: &PairSpec, timeout: Duration) -> AppResult<PricePoint> {
    tokio::time::timeout(timeout, client.fetch_spot_price(spec, timeout))
        .await
        .map_err(|_| AppError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    use super::*;
    use crate::hub::{HubConfig, PairFilter, ServerMessage};

    #[derive(Default)]
    struct ScriptedClient {
        script: Mutex<HashMap<Pair, VecDeque<AppResult<PricePoint>>>>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn push(&self, pair: &Pair, result: AppResult<PricePoint>) {
            self.script
                .lock()
                .entry(pair.clone())
                .or_default()
                .push_back(result);
        }
    }

    #[async_trait]
    impl ChainClient for ScriptedClient {
        async fn fetch_spot_price(
            &self,
            spec: &PairSpec,
            _timeout: Duration,
        ) -> AppResult<PricePoint> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.script
                .lock()
                .get_mut(&spec.pair)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err(AppError::Chain("no scripted response".into())))
        }
    }

    fn spec(base: &str) -> PairSpec {
        PairSpec {
            pair: Pair::new(base, "uosmo"),
            pool_id: 1,
            base_denom: base.into(),
            quote_denom: "uosmo".into(),
        }
    }

    fn point(price: &str, volume: &str, secs: i64) -> PricePoint {
        PricePoint {
            price: price.parse().unwrap(),
            volume: volume.parse().unwrap(),
            observed_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn config() -> AggregatorConfig {
        AggregatorConfig {
            tick_interval: Duration::from_secs(1),
            query_timeout: Duration::from_millis(800),
            candle_interval: Duration::from_secs(60),
            history_len: 16,
            max_concurrency: 4,
            shutdown_grace: Duration::from_millis(200),
        }
    }

    fn build(client: Arc<ScriptedClient>, specs: Vec<PairSpec>, config: AggregatorConfig) -> Aggregator {
        let store = Arc::new(PriceStore::new(specs.iter().map(|s| s.pair.clone())));
        let hub = Arc::new(ConnectionHub::new(
            HubConfig {
                outbound_queue: 16,
                ping_interval: Duration::from_secs(15),
                missed_pong_threshold: 3,
                write_timeout: Duration::from_secs(1),
            },
            Arc::clone(&store),
        ));
        Aggregator::new(client, store, hub, specs, config)
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn polling_loop_can_run_on_the_multi_threaded_runtime() {
        let aggregator = build(
            Arc::new(ScriptedClient::default()),
            vec![spec("uatom"), spec("uion")],
            config(),
        );
        assert_send(&aggregator.tick());
        assert_send(&aggregator.run(CancellationToken::new()));
    }

    #[tokio::test]
    async fn successful_tick_updates_ticker_and_broadcasts() {
        let atom = spec("uatom");
        let client = Arc::new(ScriptedClient::default());
        client.push(&atom.pair, Ok(point("12.5", "100", 0)));
        let aggregator = build(Arc::clone(&client), vec![atom.clone()], config());
        let mut sub = aggregator.hub.register(PairFilter::All).unwrap();
        sub.outbound.try_recv().unwrap();

        let report = aggregator.tick().await;
        assert_eq!(report.updated, 1);
        assert_eq!(report.delivered, 1);

        let entry = aggregator.store.get(&atom.pair).unwrap();
        let ticker = entry.ticker.as_ref().unwrap();
        assert_eq!(ticker.price, Decimal::new(125, 1));
        assert_eq!(ticker.volume, Decimal::from(100));
        assert_eq!(ticker.time, Utc.timestamp_opt(1_700_000_000, 0).unwrap());

        let text = sub.outbound.try_recv().unwrap();
        match serde_json::from_str::<ServerMessage>(&text).unwrap() {
            ServerMessage::Price(msg) => assert_eq!(msg.price, Decimal::new(125, 1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_query_leaves_entry_untouched() {
        let atom = spec("uatom");
        let ion = spec("uion");
        let client = Arc::new(ScriptedClient::default());
        client.push(&atom.pair, Ok(point("10", "1", 0)));
        client.push(&ion.pair, Ok(point("2", "1", 0)));
        client.push(&atom.pair, Err(AppError::Chain("node unavailable".into())));
        client.push(&ion.pair, Ok(point("3", "1", 1)));
        let aggregator = build(Arc::clone(&client), vec![atom.clone(), ion.clone()], config());

        aggregator.tick().await;
        let before = aggregator.store.get(&atom.pair).unwrap();

        let report = aggregator.tick().await;
        assert_eq!(report, TickReport { updated: 1, failed: 1, stale: 0, delivered: 0 });

        let after = aggregator.store.get(&atom.pair).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        let ion_price = aggregator.store.get(&ion.pair).unwrap().ticker.as_ref().unwrap().price;
        assert_eq!(ion_price, Decimal::from(3));
    }

    #[tokio::test]
    async fn tickers_never_move_backwards() {
        let atom = spec("uatom");
        let client = Arc::new(ScriptedClient::default());
        client.push(&atom.pair, Ok(point("10", "1", 30)));
        client.push(&atom.pair, Ok(point("9", "1", 10)));
        let aggregator = build(Arc::clone(&client), vec![atom.clone()], config());

        aggregator.tick().await;
        let report = aggregator.tick().await;
        assert_eq!(report.stale, 1);

        let ticker = aggregator.store.get(&atom.pair).unwrap().ticker.clone().unwrap();
        assert_eq!(ticker.price, Decimal::from(10));
    }

    #[tokio::test]
    async fn candle_seals_after_bucket_interval() {
        let atom = spec("uatom");
        let client = Arc::new(ScriptedClient::default());
        client.push(&atom.pair, Ok(point("10", "1", 0)));
        client.push(&atom.pair, Ok(point("12", "2", 30)));
        client.push(&atom.pair, Ok(point("11", "4", 61)));
        let aggregator = build(Arc::clone(&client), vec![atom.clone()], config());

        for _ in 0..3 {
            aggregator.tick().await;
        }

        let entry = aggregator.store.get(&atom.pair).unwrap();
        assert_eq!(entry.history.len(), 1);
        let sealed = &entry.history[0];
        assert_eq!(sealed.open, Decimal::from(10));
        assert_eq!(sealed.high, Decimal::from(12));
        assert_eq!(sealed.close, Decimal::from(12));
        assert_eq!(sealed.volume, Decimal::from(3));

        let open = entry.candle.as_ref().unwrap();
        assert_eq!(open.open, Decimal::from(11));
        assert_eq!(open.bucket_start, Utc.timestamp_opt(1_700_000_061, 0).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_queries_time_out_without_failing_the_tick() {
        let atom = spec("uatom");
        let client = Arc::new(ScriptedClient {
            delay: Duration::from_secs(5),
            ..Default::default()
        });
        client.push(&atom.pair, Ok(point("10", "1", 0)));
        let aggregator = build(Arc::clone(&client), vec![atom.clone()], config());

        let report = aggregator.tick().await;
        assert_eq!(report.failed, 1);
        assert!(aggregator.store.get(&atom.pair).unwrap().ticker.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_ticks_do_not_stack() {
        let specs = vec![spec("uatom"), spec("uion")];
        let client = Arc::new(ScriptedClient {
            delay: Duration::from_millis(700),
            ..Default::default()
        });
        let aggregator = build(
            Arc::clone(&client),
            specs,
            AggregatorConfig {
                max_concurrency: 1,
                ..config()
            },
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(aggregator.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(6)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(client.calls.load(Ordering::SeqCst) >= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_in_flight_tick_after_grace() {
        let client = Arc::new(ScriptedClient {
            delay: Duration::from_millis(700),
            ..Default::default()
        });
        let aggregator = build(Arc::clone(&client), vec![spec("uatom")], config());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(aggregator.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();

        let stopped = tokio::time::timeout(Duration::from_millis(300), handle).await;
        assert!(stopped.is_ok());
    }
}
