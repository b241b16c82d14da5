//! Dual-Rate Scheduler
//!
//! Two independent poll loops, each its own task:
//!
//! ```text
//!   fast loop (200 ms)                 normal loop (2 s)
//!   ┌──────────────────────┐           ┌──────────────────────────────┐
//!   │ prepare → read →     │           │ prepare → read → parse →     │
//!   │ parse → convert      │           │ convert; weighing exchange   │
//!   └─────────┬────────────┘           └───────────────┬──────────────┘
//!             ▼                                        ▼
//!     BatchSink(fast) + cache               BatchSink(normal) + cache
//! ```
//!
//! Plus one flusher task per rate class. Ticks are scheduled between tick
//! starts (`MissedTickBehavior::Skip`), so processing time does not stretch
//! the period and an overrun skips ticks instead of bursting. Cancellation is
//! observed at tick boundaries only; a tick in progress always completes.
//!
//! The fast period can be changed while running
//! ([`SchedulerHandle::set_fast_period`]). With an idle period configured,
//! the fast loop follows the smelting batch: full speed while a batch is
//! active, the idle period otherwise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use errors::ClassifiedError;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::BatchContext;
use crate::cache::{StatusCache, StatusSnapshot};
use crate::converter::{convert, Measurement};
use crate::parser::parse;
use crate::schema::{BlockClass, BlockSchema, RateClass, SchemaRegistry};
use crate::sink::{BatchSink, Point, Sample};
use crate::source::{DataSource, RawSample};

/// Cache key and default measurement of weighing readings
pub const WEIGHING_KEY: &str = "weighing";

/// How weighing readings are published
#[derive(Debug, Clone)]
pub struct WeighingSpec {
    pub measurement: String,
    /// Engineering value = raw register value × scale
    pub scale: f64,
    pub station: u8,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub fast_period: Duration,
    pub normal_period: Duration,
    /// Fast period while no batch is active; `None` keeps `fast_period`
    pub idle_fast_period: Option<Duration>,
    pub weighing: Option<WeighingSpec>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fast_period: Duration::from_millis(200),
            normal_period: Duration::from_secs(2),
            idle_fast_period: None,
            weighing: None,
        }
    }
}

/// Counters of one poll loop, reported when it stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub connect_failures: u64,
    pub block_reads: u64,
    pub read_failures: u64,
    pub parse_failures: u64,
    pub samples: u64,
    pub skipped_samples: u64,
    pub weighings: u64,
    pub weighing_failures: u64,
}

// ============================================================================
// Failure streaks, change filter
// ============================================================================

/// Logs the first failure of a streak at warn, repeats at debug, recovery at info
#[derive(Debug, Default)]
struct FailureStreaks {
    streaks: HashMap<String, u64>,
}

impl FailureStreaks {
    fn failure(&mut self, rate: RateClass, key: &str, error: &dyn ClassifiedError) {
        let count = self.streaks.entry(key.to_string()).or_default();
        *count += 1;
        if *count == 1 {
            warn!(
                code = error.error_code(),
                category = %error.category(),
                "{} loop: {} failed: {}",
                rate,
                key,
                error
            );
        } else {
            debug!("{} loop: {} still failing ({}): {}", rate, key, count, error);
        }
    }

    fn success(&mut self, rate: RateClass, key: &str) {
        if let Some(count) = self.streaks.remove(key) {
            info!("{} loop: {} recovered after {} failures", rate, key, count);
        }
    }
}

/// Remembers the last persisted value of `on_change` quantities
#[derive(Debug, Default)]
struct ChangeFilter {
    last: HashMap<(String, String), f64>,
}

impl ChangeFilter {
    fn admit(&mut self, block: &str, quantity: &str, value: f64) -> bool {
        let key = (block.to_string(), quantity.to_string());
        match self.last.get(&key) {
            Some(previous) if *previous == value => false,
            _ => {
                self.last.insert(key, value);
                true
            }
        }
    }
}

// ============================================================================
// Poll loop
// ============================================================================

struct PollLoop {
    rate: RateClass,
    period: Duration,
    period_updates: Option<watch::Receiver<Duration>>,
    blocks: Vec<Arc<BlockSchema>>,
    weighing: Option<WeighingSpec>,
    source: Arc<DataSource>,
    sink: Arc<BatchSink>,
    cache: Arc<StatusCache>,
    streaks: FailureStreaks,
    changes: ChangeFilter,
    alarms: HashMap<String, bool>,
    stats: LoopStats,
}

impl PollLoop {
    async fn run(mut self, cancel: CancellationToken) -> LoopStats {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "{} loop started: period {:?}, {} blocks{}",
            self.rate,
            self.period,
            self.blocks.len(),
            if self.weighing.is_some() { ", weighing" } else { "" }
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                update = next_period(&mut self.period_updates) => {
                    match update {
                        Some(period) if period != self.period => {
                            info!("{} loop period {:?} -> {:?}", self.rate, self.period, period);
                            self.period = period;
                            ticker = delayed_interval(period);
                        }
                        Some(_) => {}
                        None => self.period_updates = None,
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }

        info!("{} loop stopped: {:?}", self.rate, self.stats);
        self.stats
    }

    async fn tick(&mut self) {
        self.stats.ticks += 1;

        if !self.blocks.is_empty() {
            match self.source.prepare().await {
                Ok(()) => {
                    self.streaks.success(self.rate, "connection");
                    for schema in self.blocks.clone() {
                        self.poll_block(&schema).await;
                    }
                }
                Err(e) => {
                    self.stats.connect_failures += 1;
                    self.streaks.failure(self.rate, "connection", &e);
                }
            }
        }

        if let Some(spec) = self.weighing.clone() {
            self.poll_weighing(&spec).await;
        }
    }

    async fn poll_block(&mut self, schema: &BlockSchema) {
        self.stats.block_reads += 1;
        let raw = match self.source.read_block(schema).await {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.read_failures += 1;
                self.streaks.failure(self.rate, &schema.id, &e);
                return;
            }
        };

        let fields = match parse(schema, &raw.bytes) {
            Ok(fields) => fields,
            Err(e) => {
                self.stats.parse_failures += 1;
                self.streaks.failure(self.rate, &schema.id, &e);
                return;
            }
        };
        self.streaks.success(self.rate, &schema.id);

        for name in fields.invalid_fields() {
            debug!("Block {}: field {} could not be decoded", schema.id, name);
        }

        let measurement = convert(&fields, &schema.conversions);
        self.track_alarms(schema, &measurement);
        self.cache.update(StatusSnapshot::from_block(
            schema.id.clone(),
            &fields,
            &measurement,
            raw.read_at,
        ));

        if schema.class == BlockClass::Measurement {
            match self.build_sample(schema, &measurement, &raw) {
                Some(sample) => {
                    self.stats.samples += 1;
                    self.sink.push(self.rate, sample);
                }
                None => self.stats.skipped_samples += 1,
            }
        }
    }

    /// Available quantities plus alarm flags; `None` when nothing is left to persist
    fn build_sample(
        &mut self,
        schema: &BlockSchema,
        measurement: &Measurement,
        raw: &RawSample,
    ) -> Option<Sample> {
        let mut point = Point::new(schema.measurement.clone(), raw.read_at);
        for (key, value) in &schema.tags {
            point = point.tag(key.clone(), value.clone());
        }

        let mut values = 0;
        for quantity in &measurement.quantities {
            let Some(value) = quantity.value.value() else {
                continue;
            };
            if quantity.on_change && !self.changes.admit(&schema.id, &quantity.name, value) {
                continue;
            }
            point = point.field(quantity.name.clone(), value);
            if let Some(alarm) = quantity.alarm {
                point = point.field(format!("{}_alarm", quantity.name), alarm.in_alarm);
            }
            values += 1;
        }

        (values > 0).then(|| Sample::new(schema.id.clone(), point))
    }

    fn track_alarms(&mut self, schema: &BlockSchema, measurement: &Measurement) {
        for quantity in &measurement.quantities {
            let Some(alarm) = quantity.alarm else {
                continue;
            };
            let key = format!("{}.{}", schema.id, quantity.name);
            let was = self.alarms.insert(key, alarm.in_alarm).unwrap_or(false);
            match (was, alarm.in_alarm) {
                (false, true) => warn!(
                    "Alarm: {} {} = {:?} outside [{}, {}]",
                    schema.id,
                    quantity.name,
                    quantity.value.value(),
                    alarm.band.low,
                    alarm.band.high
                ),
                (true, false) => info!("Alarm cleared: {} {}", schema.id, quantity.name),
                _ => {}
            }
        }
    }

    async fn poll_weighing(&mut self, spec: &WeighingSpec) {
        if !self.source.has_weighing() {
            return;
        }
        let now = Utc::now();
        match self.source.read_weight().await {
            Ok(raw) => {
                self.stats.weighings += 1;
                self.streaks.success(self.rate, WEIGHING_KEY);
                let weight = f64::from(raw) * spec.scale;
                self.cache.update(StatusSnapshot::single(
                    WEIGHING_KEY,
                    "weight",
                    Some(weight),
                    now,
                ));
                let point = Point::new(spec.measurement.clone(), now)
                    .tag("station", spec.station.to_string())
                    .field("weight", weight);
                self.sink.push(self.rate, Sample::new(WEIGHING_KEY, point));
            }
            Err(e) => {
                self.stats.weighing_failures += 1;
                self.streaks.failure(self.rate, WEIGHING_KEY, &e);
                self.cache
                    .update(StatusSnapshot::single(WEIGHING_KEY, "weight", None, now));
            }
        }
    }
}

/// Next period sent on `updates`; `None` once the sender is gone
async fn next_period(updates: &mut Option<watch::Receiver<Duration>>) -> Option<Duration> {
    match updates {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

/// First tick one period from now
fn delayed_interval(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Fast period for the batch context
fn period_for(batch: Option<&BatchContext>, active: Duration, idle: Duration) -> Duration {
    if batch.is_some() {
        active
    } else {
        idle
    }
}

/// Switches the fast period as batches start and stop
async fn follow_batches(
    mut batches: watch::Receiver<Option<BatchContext>>,
    periods: Arc<watch::Sender<Duration>>,
    active: Duration,
    idle: Duration,
    cancel: CancellationToken,
) {
    loop {
        let period = period_for(batches.borrow_and_update().as_ref(), active, idle);
        periods.send_if_modified(|current| {
            let changed = *current != period;
            *current = period;
            changed
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = batches.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Wires the loops and flushers together
pub struct Scheduler {
    registry: Arc<SchemaRegistry>,
    source: Arc<DataSource>,
    sink: Arc<BatchSink>,
    cache: Arc<StatusCache>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        source: Arc<DataSource>,
        sink: Arc<BatchSink>,
        cache: Arc<StatusCache>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            source,
            sink,
            cache,
            config,
        }
    }

    fn poll_loop(&self, rate: RateClass, fast_period: &watch::Sender<Duration>) -> PollLoop {
        let (period, period_updates, weighing) = match rate {
            RateClass::Fast => (*fast_period.borrow(), Some(fast_period.subscribe()), None),
            RateClass::Normal => (self.config.normal_period, None, self.config.weighing.clone()),
        };
        PollLoop {
            rate,
            period,
            period_updates,
            blocks: self.registry.blocks_for(rate),
            weighing,
            source: self.source.clone(),
            sink: self.sink.clone(),
            cache: self.cache.clone(),
            streaks: FailureStreaks::default(),
            changes: ChangeFilter::default(),
            alarms: HashMap::new(),
            stats: LoopStats::default(),
        }
    }

    /// Start both loops and both flushers
    pub fn spawn(self, cancel: CancellationToken) -> SchedulerHandle {
        let batches = self.sink.batches().subscribe();
        let initial = match self.config.idle_fast_period {
            Some(idle) => period_for(batches.borrow().as_ref(), self.config.fast_period, idle),
            None => self.config.fast_period,
        };
        let (fast_period, _) = watch::channel(initial);
        let fast_period = Arc::new(fast_period);

        let mut loops = Vec::new();
        let mut background = Vec::new();

        for rate in RateClass::ALL {
            let poll = self.poll_loop(rate, &fast_period);
            if poll.blocks.is_empty() && poll.weighing.is_none() {
                info!("{} loop has nothing to poll, not started", rate);
            } else {
                loops.push((rate, tokio::spawn(poll.run(cancel.clone()))));
            }
            background.push(tokio::spawn(
                self.sink.clone().run_flusher(rate, cancel.clone()),
            ));
        }

        if let Some(idle) = self.config.idle_fast_period {
            info!(
                "fast loop follows batches: {:?} active, {:?} idle",
                self.config.fast_period, idle
            );
            background.push(tokio::spawn(follow_batches(
                batches,
                fast_period.clone(),
                self.config.fast_period,
                idle,
                cancel.clone(),
            )));
        }

        SchedulerHandle {
            cancel,
            loops,
            background,
            fast_period,
            sink: self.sink,
        }
    }
}

/// Running scheduler
pub struct SchedulerHandle {
    cancel: CancellationToken,
    loops: Vec<(RateClass, JoinHandle<LoopStats>)>,
    /// Flushers and the batch follower
    background: Vec<JoinHandle<()>>,
    fast_period: Arc<watch::Sender<Duration>>,
    sink: Arc<BatchSink>,
}

impl SchedulerHandle {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn fast_period(&self) -> Duration {
        *self.fast_period.borrow()
    }

    /// Switch the fast loop period; the next tick is one new period away
    pub fn set_fast_period(&self, period: Duration) {
        if period.is_zero() {
            warn!("Ignoring zero fast loop period");
            return;
        }
        self.fast_period.send_replace(period);
    }

    /// Cancel, wait for loops and background tasks, then flush what is left
    pub async fn shutdown(self) -> HashMap<RateClass, LoopStats> {
        self.cancel.cancel();

        let mut stats = HashMap::new();
        for (rate, handle) in self.loops {
            match handle.await {
                Ok(s) => {
                    stats.insert(rate, s);
                }
                Err(e) => warn!("{} loop task failed: {}", rate, e),
            }
        }
        for result in join_all(self.background).await {
            if let Err(e) = result {
                warn!("Background task failed: {}", e);
            }
        }

        self.sink.flush_all().await;
        stats
    }
}
