//! Single-flight tunnel check scheduler.
//!
//! Each [`CheckRequest`] becomes one check run on a background task. A new
//! request supersedes the run in flight: the old task is aborted and its
//! generation goes stale, so it can no longer write state or fire
//! callbacks. Only runs whose generation is still current when they finish
//! commit anything.
//!
//! A run reads `public_url` and `last_pinged_timestamp` from the store,
//! classifies the elapsed time, and either probes (forced or due) or
//! publishes the interval bucket and stops.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use tunwatch_state::{CheckInterval, StateResult, StateStore};

use crate::error::{HealthError, HealthResult};
use crate::interval::{Clock, IntervalThresholds, SystemClock, elapsed_since};
use crate::probe::{Probe, ProbeOutcome, ResponseInfo};

type SuccessCallback = Box<dyn FnOnce() + Send + 'static>;
type ErrorCallback = Box<dyn FnOnce(&ResponseInfo) + Send + 'static>;

/// A trigger for one check run.
///
/// Callbacks fire at most once, after the run's state writes, and only if
/// the run was not superseded.
pub struct CheckRequest {
    /// Probe regardless of how recently the tunnel was checked.
    pub force_now: bool,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl CheckRequest {
    pub fn new(force_now: bool) -> Self {
        Self {
            force_now,
            on_success: None,
            on_error: None,
        }
    }

    /// A request that always probes.
    pub fn forced() -> Self {
        Self::new(true)
    }

    /// A request gated by the check interval.
    pub fn periodic() -> Self {
        Self::new(false)
    }

    pub fn on_success(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&ResponseInfo) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Report `outcome` through the request's callbacks.
    ///
    /// Healthy probes go to `on_success`; unhealthy probes and
    /// `NoActiveTunnel` go to `on_error`; deferred runs fire nothing.
    /// A panicking callback is caught and returned as `HealthError::Callback`.
    pub fn deliver(self, outcome: &CheckOutcome) -> HealthResult<()> {
        let CheckRequest {
            on_success,
            on_error,
            ..
        } = self;

        let result = match outcome {
            CheckOutcome::Probed(ProbeOutcome::Healthy(_)) => {
                on_success.map(|cb| catch_unwind(AssertUnwindSafe(cb)))
            }
            CheckOutcome::Probed(ProbeOutcome::Unhealthy(info))
            | CheckOutcome::NoActiveTunnel(info) => {
                on_error.map(|cb| catch_unwind(AssertUnwindSafe(|| cb(info))))
            }
            CheckOutcome::Deferred(_) => None,
        };

        match result {
            Some(Err(payload)) => Err(HealthError::Callback(panic_message(payload.as_ref()))),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for CheckRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckRequest")
            .field("force_now", &self.force_now)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

/// Result of a completed check run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// The tunnel was probed.
    Probed(ProbeOutcome),
    /// Not due yet; the interval bucket was published instead.
    Deferred(CheckInterval),
    /// No public URL is known, so nothing was probed.
    NoActiveTunnel(ResponseInfo),
}

impl CheckOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, CheckOutcome::Probed(ProbeOutcome::Healthy(_)))
    }

    pub fn is_probed(&self) -> bool {
        matches!(self, CheckOutcome::Probed(_))
    }

    /// Response details for probed and no-tunnel outcomes.
    pub fn response_info(&self) -> Option<&ResponseInfo> {
        match self {
            CheckOutcome::Probed(probe) => Some(probe.info()),
            CheckOutcome::NoActiveTunnel(info) => Some(info),
            CheckOutcome::Deferred(_) => None,
        }
    }
}

/// Handle to a submitted check run.
#[derive(Debug)]
pub struct CheckHandle {
    generation: u64,
    join: JoinHandle<HealthResult<CheckOutcome>>,
}

impl CheckHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the run. A superseded run yields `HealthError::Superseded`.
    pub async fn wait(self) -> HealthResult<CheckOutcome> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(HealthError::Superseded),
            Err(e) => Err(HealthError::Task(e.to_string())),
        }
    }
}

/// The run currently allowed to commit.
#[derive(Default)]
struct Flight {
    generation: u64,
    abort: Option<AbortHandle>,
}

/// Single-flight check scheduler for one tunnel.
#[derive(Clone)]
pub struct Scheduler {
    tunnel: String,
    store: StateStore,
    probe: Arc<dyn Probe>,
    clock: Arc<dyn Clock>,
    thresholds: IntervalThresholds,
    flight: Arc<Mutex<Flight>>,
}

impl Scheduler {
    /// Create a scheduler for the tunnel stored under `tunnel`.
    pub fn new(tunnel: impl Into<String>, store: StateStore, probe: Arc<dyn Probe>) -> Self {
        Self {
            tunnel: tunnel.into(),
            store,
            probe,
            clock: Arc::new(SystemClock),
            thresholds: IntervalThresholds::default(),
            flight: Arc::new(Mutex::new(Flight::default())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_thresholds(mut self, thresholds: IntervalThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn tunnel(&self) -> &str {
        &self.tunnel
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Start a check run, superseding any run still in flight.
    pub async fn submit(&self, request: CheckRequest) -> CheckHandle {
        let mut flight = self.flight.lock().await;
        flight.generation += 1;
        let generation = flight.generation;

        if let Some(previous) = flight.abort.take() {
            if !previous.is_finished() {
                debug!(tunnel = %self.tunnel, generation, "superseding in-flight tunnel check");
            }
            previous.abort();
        }

        let this = self.clone();
        let join = tokio::spawn(async move { this.run(generation, request).await });
        flight.abort = Some(join.abort_handle());

        CheckHandle { generation, join }
    }

    /// Run one check without callbacks and wait for its outcome.
    pub async fn check(&self, force_now: bool) -> HealthResult<CheckOutcome> {
        self.submit(CheckRequest::new(force_now)).await.wait().await
    }

    /// Abort the run in flight, if any, without starting a new one.
    pub async fn cancel(&self) {
        let mut flight = self.flight.lock().await;
        flight.generation += 1;
        if let Some(previous) = flight.abort.take() {
            previous.abort();
            debug!(tunnel = %self.tunnel, "tunnel check cancelled");
        }
    }

    /// Generation of the most recent request.
    pub async fn generation(&self) -> u64 {
        self.flight.lock().await.generation
    }

    async fn run(self, generation: u64, request: CheckRequest) -> HealthResult<CheckOutcome> {
        let outcome = self.evaluate(request.force_now).await.inspect_err(|e| {
            error!(tunnel = %self.tunnel, error = %e, "failed to read tunnel state");
        })?;

        let persisted = {
            let flight = self.flight.lock().await;
            if flight.generation != generation {
                debug!(tunnel = %self.tunnel, generation, "stale tunnel check discarded");
                return Err(HealthError::Superseded);
            }
            self.persist(&outcome)
        };

        if let Err(e) = &persisted {
            error!(tunnel = %self.tunnel, error = %e, "failed to record tunnel check");
        }

        let delivered = request.deliver(&outcome);
        if let Err(e) = &delivered {
            error!(tunnel = %self.tunnel, error = %e, "tunnel check callback failed");
        }

        persisted?;
        delivered?;
        Ok(outcome)
    }

    /// Decide whether to probe and, if so, probe.
    async fn evaluate(&self, force_now: bool) -> StateResult<CheckOutcome> {
        let public_url = self.store.public_url(&self.tunnel)?;
        if public_url.trim().is_empty() {
            warn!(tunnel = %self.tunnel, "no active tunnel to check");
            return Ok(CheckOutcome::NoActiveTunnel(ResponseInfo::no_active_tunnel()));
        }

        let last_pinged = self.store.last_pinged_timestamp(&self.tunnel)?;
        let elapsed = elapsed_since(self.clock.now_millis(), last_pinged);
        let interval = self.thresholds.classify(elapsed);

        if !force_now && interval != CheckInterval::Now {
            debug!(
                tunnel = %self.tunnel,
                elapsed_ms = elapsed.as_millis() as u64,
                %interval,
                "tunnel check not due"
            );
            return Ok(CheckOutcome::Deferred(interval));
        }

        debug!(tunnel = %self.tunnel, url = %public_url, force_now, "probing tunnel");
        let outcome = self.probe.probe(&public_url).await;
        match &outcome {
            ProbeOutcome::Healthy(info) => {
                info!(tunnel = %self.tunnel, status = ?info.status, "tunnel healthy");
            }
            ProbeOutcome::Unhealthy(info) => {
                warn!(tunnel = %self.tunnel, reason = ?info.reason, problem = %info.describe(), "tunnel unhealthy");
            }
        }
        Ok(CheckOutcome::Probed(outcome))
    }

    fn persist(&self, outcome: &CheckOutcome) -> StateResult<()> {
        match outcome {
            CheckOutcome::Probed(_) => {
                self.store
                    .record_ping(&self.tunnel, self.clock.now_millis())?;
                self.store
                    .set_check_interval(&self.tunnel, CheckInterval::Now)
            }
            CheckOutcome::Deferred(interval) => {
                self.store.set_check_interval(&self.tunnel, *interval)
            }
            CheckOutcome::NoActiveTunnel(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::interval::ManualClock;
    use crate::probe::{UnhealthyReason, classify};

    const TUNNEL: &str = "default";
    const URL: &str = "https://x.ngrok.io";
    const T0: u64 = 1_700_000_000_000;

    /// Answers every probe with a fixed status and `Server` header.
    struct ScriptedProbe {
        status: u16,
        server: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(status: u16, server: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                status,
                server,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, url: &str) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            classify(url, self.status, self.server.map(String::from), 1)
        }
    }

    /// Holds the first probe until released; later probes answer healthy.
    struct GatedProbe {
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    impl GatedProbe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                entered: Notify::new(),
                release: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl Probe for GatedProbe {
        async fn probe(&self, url: &str) -> ProbeOutcome {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.release.notified().await;
            }
            classify(url, 200, Some("ngrok".to_string()), 1)
        }
    }

    #[derive(Default)]
    struct Recorder {
        successes: AtomicUsize,
        errors: StdMutex<Vec<ResponseInfo>>,
    }

    impl Recorder {
        fn request(self: &Arc<Self>, force_now: bool) -> CheckRequest {
            let on_ok = Arc::clone(self);
            let on_err = Arc::clone(self);
            CheckRequest::new(force_now)
                .on_success(move || {
                    on_ok.successes.fetch_add(1, Ordering::SeqCst);
                })
                .on_error(move |info| on_err.errors.lock().unwrap().push(info.clone()))
        }

        fn successes(&self) -> usize {
            self.successes.load(Ordering::SeqCst)
        }

        fn errors(&self) -> Vec<ResponseInfo> {
            self.errors.lock().unwrap().clone()
        }
    }

    fn setup(probe: Arc<dyn Probe>, now_ms: u64) -> (Scheduler, StateStore, Arc<ManualClock>) {
        let store = StateStore::open_in_memory().unwrap();
        store.set_public_url(TUNNEL, URL).unwrap();
        let clock = Arc::new(ManualClock::new(now_ms));
        let scheduler = Scheduler::new(TUNNEL, store.clone(), probe).with_clock(clock.clone());
        (scheduler, store, clock)
    }

    #[tokio::test]
    async fn healthy_probe_fires_success_once() {
        let probe = ScriptedProbe::new(200, Some("ngrok"));
        let (scheduler, store, _clock) = setup(probe.clone(), T0);
        let recorder = Arc::new(Recorder::default());

        let outcome = scheduler
            .submit(recorder.request(true))
            .await
            .wait()
            .await
            .unwrap();

        assert!(outcome.is_healthy());
        assert_eq!(probe.calls(), 1);
        assert_eq!(recorder.successes(), 1);
        assert!(recorder.errors().is_empty());
        assert_eq!(store.last_pinged_timestamp(TUNNEL).unwrap(), T0);
        assert_eq!(store.check_interval(TUNNEL).unwrap(), CheckInterval::Now);
    }

    #[tokio::test]
    async fn rate_limited_probe_fires_error_once() {
        let probe = ScriptedProbe::new(429, Some("ngrok"));
        let (scheduler, store, _clock) = setup(probe.clone(), T0);
        let recorder = Arc::new(Recorder::default());

        let outcome = scheduler
            .submit(recorder.request(true))
            .await
            .wait()
            .await
            .unwrap();

        assert!(outcome.is_probed());
        assert!(!outcome.is_healthy());
        assert_eq!(recorder.successes(), 0);
        let errors = recorder.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status, Some(429));
        assert_eq!(errors[0].reason, Some(UnhealthyReason::RateLimited));
        // Failed checks still count as completed checks.
        assert_eq!(store.last_pinged_timestamp(TUNNEL).unwrap(), T0);
    }

    #[tokio::test]
    async fn missing_server_header_fires_error() {
        let probe = ScriptedProbe::new(200, None);
        let (scheduler, _store, _clock) = setup(probe, T0);
        let recorder = Arc::new(Recorder::default());

        scheduler
            .submit(recorder.request(true))
            .await
            .wait()
            .await
            .unwrap();

        assert_eq!(recorder.successes(), 0);
        assert_eq!(
            recorder.errors()[0].reason,
            Some(UnhealthyReason::MissingServerHeader)
        );
    }

    #[tokio::test]
    async fn recent_check_is_deferred_without_probe() {
        let probe = ScriptedProbe::new(200, Some("ngrok"));
        let (scheduler, store, clock) = setup(probe.clone(), T0);
        store.record_ping(TUNNEL, T0).unwrap();
        let recorder = Arc::new(Recorder::default());

        clock.set(T0 + 10_000);
        let outcome = scheduler
            .submit(recorder.request(false))
            .await
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome, CheckOutcome::Deferred(CheckInterval::FirstInterval));
        assert_eq!(
            store.check_interval(TUNNEL).unwrap(),
            CheckInterval::FirstInterval
        );

        clock.set(T0 + 30_000);
        let outcome = scheduler.check(false).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Deferred(CheckInterval::SecondInterval));
        assert_eq!(
            store.check_interval(TUNNEL).unwrap(),
            CheckInterval::SecondInterval
        );

        assert_eq!(probe.calls(), 0);
        assert_eq!(recorder.successes(), 0);
        assert!(recorder.errors().is_empty());
        assert_eq!(store.last_pinged_timestamp(TUNNEL).unwrap(), T0);
    }

    #[tokio::test]
    async fn due_check_probes_and_records_ping() {
        let probe = ScriptedProbe::new(200, Some("ngrok"));
        let (scheduler, store, clock) = setup(probe.clone(), T0);
        store.record_ping(TUNNEL, T0).unwrap();

        clock.set(T0 + 60_000);
        let outcome = scheduler.check(false).await.unwrap();

        assert!(outcome.is_healthy());
        assert_eq!(probe.calls(), 1);
        assert_eq!(store.last_pinged_timestamp(TUNNEL).unwrap(), T0 + 60_000);
        assert_eq!(store.check_interval(TUNNEL).unwrap(), CheckInterval::Now);
    }

    #[tokio::test]
    async fn forced_check_ignores_interval() {
        let probe = ScriptedProbe::new(200, Some("ngrok"));
        let (scheduler, store, clock) = setup(probe.clone(), T0);
        store.record_ping(TUNNEL, T0).unwrap();

        clock.set(T0 + 1);
        let outcome = scheduler.check(true).await.unwrap();

        assert!(outcome.is_probed());
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn no_active_tunnel_reports_error_without_probe() {
        let probe = ScriptedProbe::new(200, Some("ngrok"));
        let store = StateStore::open_in_memory().unwrap();
        let scheduler = Scheduler::new(TUNNEL, store.clone(), probe.clone());
        let recorder = Arc::new(Recorder::default());

        let outcome = scheduler
            .submit(recorder.request(true))
            .await
            .wait()
            .await
            .unwrap();

        assert!(matches!(outcome, CheckOutcome::NoActiveTunnel(_)));
        assert_eq!(probe.calls(), 0);
        assert_eq!(recorder.successes(), 0);
        assert_eq!(
            recorder.errors()[0].reason,
            Some(UnhealthyReason::NoActiveTunnel)
        );
        assert_eq!(store.last_pinged_timestamp(TUNNEL).unwrap(), 0);
    }

    #[tokio::test]
    async fn newer_request_supersedes_in_flight_run() {
        let probe = GatedProbe::new();
        let (scheduler, store, _clock) = setup(probe.clone(), T0);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        let r1 = scheduler.submit(first.request(true)).await;
        probe.entered.notified().await;

        let r2 = scheduler.submit(second.request(true)).await;
        assert!(r2.generation() > r1.generation());

        let outcome = r2.wait().await.unwrap();
        assert!(outcome.is_healthy());
        assert!(matches!(r1.wait().await, Err(HealthError::Superseded)));

        assert_eq!(first.successes(), 0);
        assert!(first.errors().is_empty());
        assert_eq!(second.successes(), 1);
        assert_eq!(store.last_pinged_timestamp(TUNNEL).unwrap(), T0);
    }

    #[tokio::test]
    async fn superseded_run_writes_no_state() {
        let probe = GatedProbe::new();
        let (scheduler, store, clock) = setup(probe.clone(), T0);
        store.record_ping(TUNNEL, T0).unwrap();
        clock.set(T0 + 5_000);

        let r1 = scheduler.submit(CheckRequest::forced()).await;
        probe.entered.notified().await;

        // The newer request is not due, so it only publishes its bucket.
        let outcome = scheduler.check(false).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Deferred(CheckInterval::FirstInterval));

        probe.release.notify_one();
        assert!(matches!(r1.wait().await, Err(HealthError::Superseded)));

        assert_eq!(store.last_pinged_timestamp(TUNNEL).unwrap(), T0);
        assert_eq!(
            store.check_interval(TUNNEL).unwrap(),
            CheckInterval::FirstInterval
        );
    }

    #[tokio::test]
    async fn cancel_aborts_without_callbacks() {
        let probe = GatedProbe::new();
        let (scheduler, _store, _clock) = setup(probe.clone(), T0);
        let recorder = Arc::new(Recorder::default());

        let handle = scheduler.submit(recorder.request(true)).await;
        probe.entered.notified().await;
        scheduler.cancel().await;

        assert!(matches!(handle.wait().await, Err(HealthError::Superseded)));
        assert_eq!(recorder.successes(), 0);
        assert!(recorder.errors().is_empty());
    }

    #[tokio::test]
    async fn panicking_callback_is_reported_after_state_writes() {
        let probe = ScriptedProbe::new(200, Some("ngrok"));
        let (scheduler, store, _clock) = setup(probe, T0);
        store
            .set_check_interval(TUNNEL, CheckInterval::SecondInterval)
            .unwrap();

        let request = CheckRequest::forced().on_success(|| panic!("ui went away"));
        let result = scheduler.submit(request).await.wait().await;

        match result {
            Err(HealthError::Callback(msg)) => assert!(msg.contains("ui went away")),
            other => panic!("expected callback error, got {other:?}"),
        }
        assert_eq!(store.check_interval(TUNNEL).unwrap(), CheckInterval::Now);
        assert_eq!(store.last_pinged_timestamp(TUNNEL).unwrap(), T0);

        // The scheduler keeps working afterwards.
        assert!(scheduler.check(true).await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn sequential_runs_keep_timestamp_monotonic() {
        let probe = ScriptedProbe::new(200, Some("ngrok"));
        let (scheduler, store, clock) = setup(probe, T0);

        scheduler.check(true).await.unwrap();
        clock.set(T0 - 10_000);
        scheduler.check(true).await.unwrap();

        assert_eq!(store.last_pinged_timestamp(TUNNEL).unwrap(), T0);
    }

    #[test]
    fn deferred_outcome_fires_no_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (a, b) = (fired.clone(), fired.clone());
        let request = CheckRequest::periodic()
            .on_success(move || {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_| {
                b.fetch_add(1, Ordering::SeqCst);
            });

        request
            .deliver(&CheckOutcome::Deferred(CheckInterval::SecondInterval))
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let json =
            serde_json::to_value(CheckOutcome::Deferred(CheckInterval::FirstInterval)).unwrap();
        assert_eq!(json["kind"], "deferred");
        assert_eq!(json["detail"], "first_interval");
    }

    #[tokio::test]
    async fn thresholds_are_configurable() {
        let probe = ScriptedProbe::new(200, Some("ngrok"));
        let (scheduler, store, clock) = setup(probe.clone(), T0);
        let scheduler = scheduler.with_thresholds(IntervalThresholds {
            first: Duration::from_secs(1),
            due: Duration::from_secs(2),
        });
        store.record_ping(TUNNEL, T0).unwrap();

        clock.set(T0 + 1_500);
        assert_eq!(
            scheduler.check(false).await.unwrap(),
            CheckOutcome::Deferred(CheckInterval::SecondInterval)
        );
        clock.set(T0 + 2_000);
        assert!(scheduler.check(false).await.unwrap().is_probed());
        assert_eq!(probe.calls(), 1);
    }
}
