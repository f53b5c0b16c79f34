//! Driver: runs the dispatcher and the occasion scheduler on their own timers.
//! Uses tokio::interval, so it sleeps between polls.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use vigil_core::config::SchedulerConfig;
use vigil_core::error::Result;

use crate::dispatch::{DispatchReport, Dispatcher};
use crate::occasions::{OccasionScheduler, SchedulingReport};

/// Poll cadence of the driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub dispatch_interval: Duration,
    pub occasion_interval: Duration,
    /// Reclaim `sending` rows older than this before each dispatch poll.
    pub stale_sending: Option<Duration>,
}

impl From<&SchedulerConfig> for DriverConfig {
    fn from(c: &SchedulerConfig) -> Self {
        Self {
            dispatch_interval: Duration::from_secs(c.dispatch_interval_secs),
            occasion_interval: Duration::from_secs(c.occasion_interval_secs),
            stale_sending: (c.stale_sending_secs > 0)
                .then(|| Duration::from_secs(c.stale_sending_secs)),
        }
    }
}

/// Owns the two polling loops.
pub struct Driver {
    dispatcher: Arc<Dispatcher>,
    occasions: Arc<OccasionScheduler>,
    config: DriverConfig,
    shutdown_tx: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl Driver {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        occasions: Arc<OccasionScheduler>,
        config: DriverConfig,
    ) -> Self {
        Self {
            dispatcher,
            occasions,
            config,
            shutdown_tx: None,
            handles: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Spawn both loops. Each fires immediately, then on its interval.
    pub fn start(&mut self) {
        if self.is_running() {
            tracing::warn!("⚠️ Driver already running");
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            "⏰ Driver started (dispatch every {:?}, scheduling every {:?})",
            self.config.dispatch_interval,
            self.config.occasion_interval
        );

        self.handles.push(tokio::spawn(dispatch_loop(
            self.dispatcher.clone(),
            self.config.dispatch_interval,
            self.config.stale_sending,
            shutdown_rx.clone(),
        )));
        self.handles.push(tokio::spawn(occasion_loop(
            self.occasions.clone(),
            self.config.occasion_interval,
            shutdown_rx,
        )));
        self.shutdown_tx = Some(shutdown_tx);
    }

    /// Signal both loops and wait for them. An in-flight cycle finishes first.
    pub async fn stop(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        tx.send(true).ok();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!("Driver loop ended abnormally: {e}");
            }
        }
        tracing::info!("🛑 Driver stopped");
    }

    /// One scheduling pass followed by one dispatch pass.
    pub async fn run_once(&self) -> Result<(SchedulingReport, DispatchReport)> {
        if let Some(age) = self.config.stale_sending {
            reclaim(&self.dispatcher, age);
        }
        let scheduled = self.occasions.run_scheduling_cycle().await;
        let dispatched = self.dispatcher.dispatch_cycle().await?;
        Ok((scheduled, dispatched))
    }
}

fn reclaim(dispatcher: &Dispatcher, age: Duration) {
    if let Err(e) = dispatcher.reclaim_stale(age) {
        tracing::error!("Stale-sending sweep failed: {e}");
    }
}

async fn dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    every: Duration,
    stale_sending: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if let Some(age) = stale_sending {
            reclaim(&dispatcher, age);
        }
        if let Err(e) = dispatcher.dispatch_cycle().await {
            tracing::error!("Dispatch cycle aborted: {e}");
        }
    }
}

async fn occasion_loop(
    occasions: Arc<OccasionScheduler>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        occasions.run_scheduling_cycle().await;
    }
}
