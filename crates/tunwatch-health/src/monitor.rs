//! Tunnel monitor: background task that drives the scheduler.
//!
//! The `TunnelMonitor` issues a forced check as soon as it starts, then an
//! interval-gated check on every tick. `check_now` forces a check between
//! ticks; it supersedes whatever run is in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::HealthError;
use crate::probe::ResponseInfo;
use crate::scheduler::{CheckHandle, CheckRequest, Scheduler};

/// Invoked after a healthy probe.
pub type SuccessHook = Arc<dyn Fn() + Send + Sync>;

/// Invoked after an unhealthy probe or when no tunnel is active.
pub type ErrorHook = Arc<dyn Fn(&ResponseInfo) + Send + Sync>;

#[derive(Clone, Default)]
struct Hooks {
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
}

impl Hooks {
    fn request(&self, force_now: bool) -> CheckRequest {
        let mut request = CheckRequest::new(force_now);
        if let Some(hook) = self.on_success.clone() {
            request = request.on_success(move || hook());
        }
        if let Some(hook) = self.on_error.clone() {
            request = request.on_error(move |info| hook(info));
        }
        request
    }
}

/// Running loop state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Periodic driver for one tunnel's scheduler.
pub struct TunnelMonitor {
    scheduler: Scheduler,
    tick: Duration,
    hooks: Hooks,
    slot: Mutex<Option<MonitorSlot>>,
}

impl TunnelMonitor {
    pub fn new(scheduler: Scheduler, tick: Duration) -> Self {
        Self {
            scheduler,
            tick,
            hooks: Hooks::default(),
            slot: Mutex::new(None),
        }
    }

    /// Set the callbacks attached to every check this monitor issues.
    pub fn with_callbacks(mut self, on_success: SuccessHook, on_error: ErrorHook) -> Self {
        self.hooks = Hooks {
            on_success: Some(on_success),
            on_error: Some(on_error),
        };
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Start the tick loop, replacing a loop that is already running.
    pub async fn start(&self) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = self.scheduler.clone();
        let hooks = self.hooks.clone();
        let tick = self.tick;

        let handle = tokio::spawn(async move {
            run_tick_loop(scheduler, hooks, tick, shutdown_rx).await;
        });

        let mut slot = self.slot.lock().await;
        if let Some(old) = slot.replace(MonitorSlot {
            handle,
            shutdown_tx,
        }) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(
            tunnel = %self.scheduler.tunnel(),
            tick_ms = tick.as_millis() as u64,
            "tunnel monitor started"
        );
    }

    /// Force a check now, superseding any run in flight.
    pub async fn check_now(&self) -> CheckHandle {
        self.scheduler.submit(self.hooks.request(true)).await
    }

    /// Stop the tick loop and abort the run in flight.
    pub async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(old) = slot.take() {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
            self.scheduler.cancel().await;
            info!(tunnel = %self.scheduler.tunnel(), "tunnel monitor stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

/// The tick loop for a single tunnel.
async fn run_tick_loop(
    scheduler: Scheduler,
    hooks: Hooks,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(tick);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut force_now = true;

    debug!(tunnel = %scheduler.tunnel(), "tunnel tick loop starting");

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let handle = scheduler.submit(hooks.request(force_now)).await;
                force_now = false;

                match handle.wait().await {
                    Ok(outcome) => debug!(tunnel = %scheduler.tunnel(), ?outcome, "tick check finished"),
                    Err(HealthError::Superseded) => {
                        debug!(tunnel = %scheduler.tunnel(), "tick check superseded");
                    }
                    Err(e) => warn!(tunnel = %scheduler.tunnel(), error = %e, "tick check failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!(tunnel = %scheduler.tunnel(), "tunnel tick loop shutting down");
                break;
            }
        }
    }
}
