use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::gazetteer::Gazetteer;
use crate::ingestion::{load_universe, AddressRecord};
use crate::navigation::{Navigator, SessionFactory};
use crate::pacing::{Pacing, RunCounters, Verdict};
use crate::resolution::Resolver;
use crate::resume::{pending, plan_store, ResumePlan};
use crate::store::{tally_store, CsvOutcomeStore, OutcomeStore, StoreTally};

const PAUSE_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Resolving,
    CoolingDown,
    HaltedByCircuitBreaker,
    Done,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub final_state: RunState,
    pub store_path: PathBuf,
    pub redirected_from: Option<PathBuf>,
    pub universe: usize,
    pub pending_at_start: usize,
    pub attempted: usize,
    pub counters: RunCounters,
    pub cooldowns: usize,
    pub write_failures: usize,
    pub store: StoreTally,
    /// Universe ids with no row in the store after this run.
    pub unprocessed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Everything `Init` produces before the first record is attempted.
pub struct PreparedRun {
    pub universe: Vec<AddressRecord>,
    pub resolver: Resolver,
    pub plan: ResumePlan,
}

impl PreparedRun {
    pub fn pending(&self) -> Vec<&AddressRecord> {
        pending(&self.universe, &self.plan.persisted)
    }
}

/// Mutable state of one run, owned by the driver for its duration.
struct RunContext {
    state: RunState,
    counters: RunCounters,
    attempted: usize,
    cooldowns: usize,
    write_failures: usize,
}

impl RunContext {
    fn new() -> Self {
        Self {
            state: RunState::Init,
            counters: RunCounters::default(),
            attempted: 0,
            cooldowns: 0,
            write_failures: 0,
        }
    }
}

pub struct BatchDriver<F> {
    config: AppConfig,
    factory: F,
    pacing: Pacing,
    cancel: Arc<AtomicBool>,
    last_summary: Option<RunSummary>,
}

impl<F: SessionFactory> BatchDriver<F> {
    pub fn new(config: AppConfig, factory: F) -> Self {
        let pacing = Pacing::new(config.pacing.clone());
        Self {
            config,
            factory,
            pacing,
            cancel: Arc::new(AtomicBool::new(false)),
            last_summary: None,
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Summary of the most recent run, including one that ended in an error
    /// after records were already attempted.
    pub fn last_summary(&self) -> Option<&RunSummary> {
        self.last_summary.as_ref()
    }

    /// Loads the universe, gazetteer and resume state. Fails fast on
    /// configuration errors; nothing is written here.
    pub fn prepare(&self) -> AppResult<PreparedRun> {
        let universe = load_universe(&self.config.input_csv, &self.config.columns)?;
        let gazetteer = Gazetteer::load(self.config.gazetteer_csv.as_deref());
        let resolver = Resolver::new(gazetteer, &self.config.search_base_url)?;
        let plan = plan_store(&self.config.output_csv, &self.config.columns.unique_id)?;
        Ok(PreparedRun {
            universe,
            resolver,
            plan,
        })
    }

    pub async fn run(&mut self) -> AppResult<RunSummary> {
        let prepared = self.prepare()?;
        let mut store =
            CsvOutcomeStore::new(&prepared.plan.store_path, &self.config.columns.unique_id);
        self.execute(&prepared, &mut store).await
    }

    pub async fn execute(
        &mut self,
        prepared: &PreparedRun,
        store: &mut dyn OutcomeStore,
    ) -> AppResult<RunSummary> {
        let started_at = Utc::now();
        let mut ctx = RunContext::new();
        let pending = prepared.pending();
        info!(
            target: "driver",
            universe = prepared.universe.len(),
            pending = pending.len(),
            fallback_gazetteer = prepared.resolver.gazetteer().len(),
            "batch initialized"
        );

        if pending.is_empty() {
            info!(target: "driver", "all addresses already geocoded");
            ctx.state = RunState::Done;
            return Ok(self.reconcile(prepared, store, ctx, 0, started_at));
        }

        let mut session = self.factory.open().await?;
        ctx.state = RunState::Resolving;
        let result = self.resolve_pending(prepared, &pending, store, &mut session, &mut ctx).await;
        if let Err(err) = session.close().await {
            warn!(target: "driver", error = %err, "failed to close navigation session");
        }
        let summary = self.reconcile(prepared, store, ctx, pending.len(), started_at);
        result.map(|()| summary)
    }

    async fn resolve_pending(
        &mut self,
        prepared: &PreparedRun,
        pending: &[&AddressRecord],
        store: &mut dyn OutcomeStore,
        session: &mut Box<dyn Navigator>,
        ctx: &mut RunContext,
    ) -> AppResult<()> {
        let total = pending.len();
        for (index, record) in pending.iter().enumerate() {
            if self.is_cancelled() {
                ctx.state = RunState::Interrupted;
                break;
            }
            info!(
                target: "driver",
                id = %record.id,
                address = %record.address,
                position = index + 1,
                total,
                "resolving address"
            );

            let fallback_delay = self.pacing.request_delay();
            let outcome = prepared
                .resolver
                .resolve(record, session.as_mut(), fallback_delay)
                .await;
            if let Err(err) = store.append(&outcome) {
                ctx.write_failures += 1;
                error!(
                    target: "driver",
                    id = %outcome.id,
                    error = %err,
                    "failed to persist outcome; it will be retried on the next run"
                );
            }
            self.pause(self.pacing.config().write_settle()).await;

            ctx.counters.record(&outcome);
            ctx.attempted += 1;
            info!(
                target: "driver",
                id = %outcome.id,
                tier = outcome.tier.as_str(),
                status = %outcome.status,
                successes = ctx.counters.successes,
                failures = ctx.counters.failures,
                fallback_successes = ctx.counters.fallback_successes,
                failure_rate = format_args!("{:.1}", ctx.counters.failure_rate()),
                "attempt recorded"
            );

            match self.pacing.verdict(&ctx.counters) {
                Verdict::Halt { failure_rate } => {
                    warn!(
                        target: "driver",
                        failure_rate = format_args!("{failure_rate:.1}"),
                        ceiling = self.pacing.config().max_failure_rate,
                        attempts = ctx.counters.attempts(),
                        "failure rate above ceiling; halting batch"
                    );
                    ctx.state = RunState::HaltedByCircuitBreaker;
                    return Ok(());
                }
                Verdict::Cooldown(delay) => {
                    ctx.state = RunState::CoolingDown;
                    warn!(
                        target: "driver",
                        consecutive_failures = ctx.counters.consecutive_failures,
                        cooldown_secs = format_args!("{:.1}", delay.as_secs_f64()),
                        "consecutive failures; cooling down and restarting session"
                    );
                    self.pause(delay).await;
                    if self.is_cancelled() {
                        ctx.state = RunState::Interrupted;
                        return Ok(());
                    }
                    ctx.counters.consecutive_failures = 0;
                    ctx.cooldowns += 1;
                    if let Err(err) = session.close().await {
                        warn!(
                            target: "driver",
                            error = %err,
                            "failed to close session before restart"
                        );
                    }
                    *session = self.factory.open().await.map_err(|err| {
                        error!(
                            target: "driver",
                            error = %err,
                            "unable to reopen session after cooldown"
                        );
                        err
                    })?;
                    ctx.state = RunState::Resolving;
                }
                Verdict::Continue => {}
            }

            if index + 1 < total {
                let delay = self.pacing.request_delay();
                self.pause(delay).await;
            }
        }

        if ctx.state == RunState::Resolving {
            ctx.state = RunState::Done;
        }
        Ok(())
    }

    fn reconcile(
        &mut self,
        prepared: &PreparedRun,
        store: &dyn OutcomeStore,
        ctx: RunContext,
        pending_at_start: usize,
        started_at: DateTime<Utc>,
    ) -> RunSummary {
        let tally = tally_store(store.path(), &self.config.columns.unique_id).unwrap_or_else(|err| {
            warn!(target: "driver", error = %err, "unable to read store for reconciliation");
            StoreTally::default()
        });
        let unprocessed = prepared
            .universe
            .iter()
            .filter(|record| !tally.ids.contains(&record.id))
            .count();

        let summary = RunSummary {
            final_state: ctx.state,
            store_path: store.path().to_path_buf(),
            redirected_from: prepared.plan.redirected_from.clone(),
            universe: prepared.universe.len(),
            pending_at_start,
            attempted: ctx.attempted,
            counters: ctx.counters,
            cooldowns: ctx.cooldowns,
            write_failures: ctx.write_failures,
            store: tally,
            unprocessed,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            target: "driver",
            state = ?summary.final_state,
            persisted = summary.store.rows,
            with_coordinates = summary.store.with_coordinates,
            needing_manual_geocoding = summary.store.with_error,
            fallback_successes = summary.counters.fallback_successes,
            unprocessed = summary.unprocessed,
            "batch summary"
        );
        if summary.store.rows != summary.store.distinct_ids {
            warn!(
                target: "driver",
                rows = summary.store.rows,
                distinct_ids = summary.store.distinct_ids,
                "store holds repeated identifiers"
            );
        }
        self.last_summary = Some(summary.clone());
        summary
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Sleeps in short slices so an interrupt is noticed mid-pause.
    async fn pause(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            sleep((deadline - now).min(PAUSE_SLICE)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    use super::*;
    use crate::config::PacingConfig;
    use crate::errors::AppError;
    use crate::outcome::ResolutionOutcome;

    #[derive(Default)]
    struct SessionLog {
        opened: usize,
        closed: usize,
        visited: Vec<String>,
        visited_at: Vec<Instant>,
    }

    /// Answers by target; unknown targets echo back unresolved.
    #[derive(Clone, Default)]
    struct FakeFactory {
        answers: Arc<HashMap<String, Result<String, String>>>,
        log: Arc<Mutex<SessionLog>>,
        cancel_after: Option<(usize, Arc<AtomicBool>)>,
        fail_reopen: bool,
    }

    struct FakeSession {
        factory: FakeFactory,
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn open(&self) -> AppResult<Box<dyn Navigator>> {
            let mut log = self.log.lock();
            log.opened += 1;
            if self.fail_reopen && log.opened > 1 {
                return Err(AppError::Navigation("chromedriver unreachable".into()));
            }
            Ok(Box::new(FakeSession {
                factory: self.clone(),
            }))
        }
    }

    #[async_trait]
    impl Navigator for FakeSession {
        async fn resolve(&mut self, target: &str) -> AppResult<String> {
            let visits = {
                let mut log = self.factory.log.lock();
                log.visited.push(target.to_string());
                log.visited_at.push(Instant::now());
                log.visited.len()
            };
            if let Some((limit, flag)) = &self.factory.cancel_after {
                if visits == *limit {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            match self.factory.answers.get(target) {
                Some(Ok(resolved)) => Ok(resolved.clone()),
                Some(Err(message)) => Err(AppError::Navigation(message.clone())),
                None => Ok(target.to_string()),
            }
        }

        async fn close(&mut self) -> AppResult<()> {
            self.factory.log.lock().closed += 1;
            Ok(())
        }
    }

    fn write_universe(dir: &Path, rows: &[(&str, bool)]) -> AppConfig {
        let input = dir.join("ready.csv");
        let mut csv = String::from("id,Address,url\n");
        for (id, _) in rows {
            csv.push_str(&format!("{id},{id} Main St,https://m/search/{id}\n"));
        }
        fs::write(&input, csv).unwrap();
        let mut config = AppConfig::new(input, dir.join("out.csv"));
        config.pacing = PacingConfig::immediate();
        config
    }

    fn factory_for(rows: &[(&str, bool)]) -> FakeFactory {
        let answers = rows
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(id, _)| {
                (
                    format!("https://m/search/{id}"),
                    Ok(format!("https://m/place/{id}/@10.5,20.25,17z")),
                )
            })
            .collect();
        FakeFactory {
            answers: Arc::new(answers),
            ..FakeFactory::default()
        }
    }

    fn driver(config: AppConfig, factory: FakeFactory) -> BatchDriver<FakeFactory> {
        let pacing = Pacing::with_rng(config.pacing.clone(), StdRng::seed_from_u64(3));
        BatchDriver::new(config, factory).with_pacing(pacing)
    }

    fn stored_ids(path: &Path) -> Vec<String> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader
            .records()
            .map(|r| r.unwrap().get(0).unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn empty_pending_set_skips_session() {
        let dir = tempdir().unwrap();
        let config = write_universe(dir.path(), &[("1", true)]);
        fs::write(&config.output_csv, "id,Address\n1,done\n").unwrap();
        let mut driver = driver(config, factory_for(&[]));

        let summary = driver.run().await.unwrap();
        assert_eq!(summary.final_state, RunState::Done);
        assert_eq!(summary.attempted, 0);
        assert_eq!(driver.factory().log.lock().opened, 0);
    }

    #[tokio::test]
    async fn cooldown_restarts_session_at_fifth_consecutive_failure() {
        let dir = tempdir().unwrap();
        let rows = [
            ("1", false),
            ("2", false),
            ("3", false),
            ("4", false),
            ("5", false),
            ("6", true),
            ("7", false),
        ];
        let config = write_universe(dir.path(), &rows);
        let mut driver = driver(config, factory_for(&rows));

        let summary = driver.run().await.unwrap();
        assert_eq!(summary.final_state, RunState::Done);
        assert_eq!(summary.cooldowns, 1);
        assert_eq!(summary.attempted, 7);
        assert_eq!(summary.counters.consecutive_failures, 1);
        let log = driver.factory().log.lock();
        assert_eq!(log.opened, 2);
        assert_eq!(log.closed, 2);
    }

    #[tokio::test]
    async fn breaker_halts_after_minimum_sample() {
        let dir = tempdir().unwrap();
        let ids: Vec<String> = (0..40).map(|i| i.to_string()).collect();
        // Every seventh record fails: 5 of the first 35 is 14.3%, so no halt.
        let healthy: Vec<(&str, bool)> = ids
            .iter()
            .map(|id| (id.as_str(), id.parse::<usize>().unwrap() % 7 != 6))
            .collect();
        let config = write_universe(dir.path(), &healthy);
        let summary = driver(config, factory_for(&healthy)).run().await.unwrap();
        assert_eq!(summary.final_state, RunState::Done);
        assert_eq!(summary.attempted, 40);

        let dir = tempdir().unwrap();
        // Records 0..6 fail, the rest succeed: 6 of 35 is 17.1% at the check.
        let failing: Vec<(&str, bool)> = ids
            .iter()
            .map(|id| (id.as_str(), id.parse::<usize>().unwrap() >= 6))
            .collect();
        let mut config = write_universe(dir.path(), &failing);
        config.pacing.max_consecutive_failures = 100;
        let output = config.output_csv.clone();
        let summary = driver(config, factory_for(&failing)).run().await.unwrap();
        assert_eq!(summary.final_state, RunState::HaltedByCircuitBreaker);
        assert_eq!(summary.attempted, 35);
        assert_eq!(stored_ids(&output).len(), 35);
        assert_eq!(summary.unprocessed, 5);
    }

    #[tokio::test]
    async fn interrupt_is_honoured_between_records() {
        let dir = tempdir().unwrap();
        let rows = [("a", true), ("b", true), ("c", true), ("d", true)];
        let config = write_universe(dir.path(), &rows);
        let output = config.output_csv.clone();
        let flag = Arc::new(AtomicBool::new(false));
        let mut factory = factory_for(&rows);
        factory.cancel_after = Some((2, Arc::clone(&flag)));

        let mut driver = driver(config, factory).with_cancel_flag(flag);
        let summary = driver.run().await.unwrap();
        assert_eq!(summary.final_state, RunState::Interrupted);
        assert_eq!(stored_ids(&output), vec!["a", "b"]);
        assert_eq!(driver.factory().log.lock().closed, 1);

        driver.cancel_flag().store(false, Ordering::SeqCst);
        let summary = driver.run().await.unwrap();
        assert_eq!(summary.final_state, RunState::Done);
        assert_eq!(stored_ids(&output), vec!["a", "b", "c", "d"]);
    }

    struct FlakyStore {
        inner: CsvOutcomeStore,
        fail_ids: Vec<String>,
    }

    impl OutcomeStore for FlakyStore {
        fn append(&mut self, outcome: &ResolutionOutcome) -> AppResult<()> {
            if self.fail_ids.contains(&outcome.id) {
                return Err(AppError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "simulated disk full",
                )));
            }
            self.inner.append(outcome)
        }

        fn path(&self) -> &Path {
            self.inner.path()
        }
    }

    #[tokio::test]
    async fn write_failures_do_not_stop_the_run() {
        let dir = tempdir().unwrap();
        let rows = [("1", true), ("2", true), ("3", true)];
        let config = write_universe(dir.path(), &rows);
        let output = config.output_csv.clone();
        let mut driver = driver(config, factory_for(&rows));
        let prepared = driver.prepare().unwrap();
        let mut store = FlakyStore {
            inner: CsvOutcomeStore::new(&output, "id"),
            fail_ids: vec!["2".into()],
        };

        let summary = driver.execute(&prepared, &mut store).await.unwrap();
        assert_eq!(summary.write_failures, 1);
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.unprocessed, 1);
        assert_eq!(stored_ids(&output), vec!["1", "3"]);
    }

    fn all_failing() -> [(&'static str, bool); 6] {
        [
            ("1", false),
            ("2", false),
            ("3", false),
            ("4", false),
            ("5", false),
            ("6", false),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn default_pacing_spaces_navigations_and_cools_down() {
        let dir = tempdir().unwrap();
        let rows = all_failing();
        let mut config = write_universe(dir.path(), &rows);
        config.pacing = PacingConfig::default();
        let mut driver = driver(config, factory_for(&rows));

        let summary = driver.run().await.unwrap();
        assert_eq!(summary.cooldowns, 1);

        let log = driver.factory().log.lock();
        assert_eq!(log.opened, 2);
        assert_eq!(log.visited_at.len(), 6);
        // Each gap is the write settle plus the request delay; the fifth
        // failure in a row adds the cooldown before the session restart.
        let settle = Duration::from_millis(500);
        let slack = Duration::from_millis(100);
        let request_floor = settle + Duration::from_millis(3_800);
        let request_ceiling = settle + Duration::from_millis(8_000) + slack;
        for (index, pair) in log.visited_at.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            if index == 4 {
                assert!(gap >= request_floor + Duration::from_secs(20), "restart gap {gap:?}");
                assert!(gap <= request_ceiling + Duration::from_secs(30), "restart gap {gap:?}");
            } else {
                assert!(gap >= request_floor, "gap {index} was {gap:?}");
                assert!(gap <= request_ceiling, "gap {index} was {gap:?}");
            }
        }
    }

    #[tokio::test]
    async fn failed_session_restart_still_reconciles() {
        let dir = tempdir().unwrap();
        let rows = all_failing();
        let config = write_universe(dir.path(), &rows);
        let mut factory = factory_for(&rows);
        factory.fail_reopen = true;
        let mut driver = driver(config, factory);

        let err = driver.run().await.unwrap_err();
        assert!(matches!(err, AppError::Navigation(_)));

        let summary = driver.last_summary().expect("summary after failed restart");
        assert_eq!(summary.final_state, RunState::CoolingDown);
        assert_eq!(summary.attempted, 5);
        assert_eq!(summary.store.rows, 5);
        assert_eq!(summary.unprocessed, 1);
    }
}
