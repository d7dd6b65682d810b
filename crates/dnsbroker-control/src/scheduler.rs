//! Periodic driver for rate-limit refills and keepalive
//!
//! One tick per `tick_interval`. Every tick refills every tenant; every
//! `keepalive_every`-th tick then runs keepalive. Keepalive is derived from the
//! tick counter rather than a second timer, so the two cadences cannot drift,
//! and on shared ticks the refill always lands first.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_KEEPALIVE_EVERY: u32 = 30;

/// The targets of a scheduler pass
pub trait TenantSet: Send + Sync + 'static {
    /// Refill every tenant's rate budget
    fn refill_all(&self);

    /// Run liveness checks on every tenant
    fn keepalive_all(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Keepalive runs on ticks that are a multiple of this (min 1)
    pub keepalive_every: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            keepalive_every: DEFAULT_KEEPALIVE_EVERY,
        }
    }
}

impl SchedulerConfig {
    /// Time between keepalive passes; tunnels silent this long are evicted
    pub fn keepalive_window(&self) -> Duration {
        self.tick_interval * self.keepalive_every.max(1)
    }
}

pub struct Scheduler<S: TenantSet> {
    tenants: Arc<S>,
    config: SchedulerConfig,
    ticks: u64,
}

impl<S: TenantSet> Scheduler<S> {
    pub fn new(tenants: Arc<S>, config: SchedulerConfig) -> Self {
        Self {
            tenants,
            config,
            ticks: 0,
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Ticks processed so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run one scheduler pass; returns true if keepalive ran
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        self.tenants.refill_all();

        if self.ticks % u64::from(self.config.keepalive_every.max(1)) == 0 {
            debug!(tick = self.ticks, "Running keepalive");
            self.tenants.keepalive_all();
            return true;
        }
        false
    }

    /// Tick until `cancel` fires. The first tick happens one interval after start.
    pub async fn run(mut self, cancel: CancellationToken) {
        let period = self.config.tick_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            tick_interval = ?period,
            keepalive_every = self.config.keepalive_every,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }

        info!(ticks = self.ticks, "Scheduler stopped");
    }

    /// Run on a background task
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
