//! Memory, CPU and latency supervision.
//!
//! The governor samples a [`ResourceProbe`] on a fixed interval, turns the
//! readings into a [`PressureLevel`] and reacts: elevated pressure shrinks
//! the pool's idle reserve, critical pressure empties it, reclaims leaked
//! checkouts and drops optional analysis stages. Levels rise immediately and
//! fall only after `recovery_debounce` calm samples in a row.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::audio::pool::BufferPool;
use crate::config::GovernorConfig;
use crate::error::{AnalysisError, Result};
use crate::mood::unix_millis;
use crate::options::AnalysisOptions;
use crate::pipeline::feed::{Feed, PipelineEvent};
use crate::pipeline::AnalysisContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    #[default]
    Normal,
    Elevated,
    Critical,
}

impl PressureLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PressureLevel::Normal,
            1 => PressureLevel::Elevated,
            _ => PressureLevel::Critical,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PressureLevel::Normal => 0,
            PressureLevel::Elevated => 1,
            PressureLevel::Critical => 2,
        }
    }

    /// Run the classifier on every n-th buffer.
    pub fn classifier_stride(self) -> u32 {
        match self {
            PressureLevel::Normal => 1,
            PressureLevel::Elevated => 2,
            PressureLevel::Critical => 4,
        }
    }

    /// Stages to run under this level.
    pub fn degrade(self, options: AnalysisOptions) -> AnalysisOptions {
        match self {
            PressureLevel::Critical => options.without(AnalysisOptions::OPTIONAL_UNDER_PRESSURE),
            _ => options,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureEvent {
    pub level: PressureLevel,
    pub previous: PressureLevel,
    /// Highest of the memory and latency ratios that drove the decision
    pub ratio: f32,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    pub pool_bytes: usize,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub memory_bytes: u64,
    /// Process CPU usage; 100.0 is one fully used core
    pub cpu_percent: f32,
}

pub trait ResourceProbe: Send {
    fn sample(&mut self) -> Result<ResourceSample>;
}

/// Reads this process's resident memory and CPU usage through `sysinfo`.
pub struct SystemProbe {
    system: System,
    pid: Option<Pid>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&mut self) -> Result<ResourceSample> {
        let pid = self
            .pid
            .ok_or_else(|| AnalysisError::DeviceResourcesUnavailable("current pid unknown".into()))?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );
        let process = self.system.process(pid).ok_or_else(|| {
            AnalysisError::DeviceResourcesUnavailable("process not visible to sysinfo".into())
        })?;
        Ok(ResourceSample {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        })
    }
}

/// Per-buffer processing times, written by the analysis worker and read by
/// the governor without locking.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    count: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
    window_count: AtomicU64,
    window_us: AtomicU64,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
        self.window_us.fetch_add(us, Ordering::Relaxed);
        self.window_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> Option<Duration> {
        let n = self.count.load(Ordering::Relaxed);
        (n > 0).then(|| Duration::from_micros(self.total_us.load(Ordering::Relaxed) / n))
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_us.load(Ordering::Relaxed))
    }

    /// Mean since the previous call.
    pub fn take_window(&self) -> Option<Duration> {
        let n = self.window_count.swap(0, Ordering::Relaxed);
        let us = self.window_us.swap(0, Ordering::Relaxed);
        (n > 0).then(|| Duration::from_micros(us / n))
    }
}

/// Current pressure level, shared between the governor and analysis
/// workers.
#[derive(Debug, Default)]
pub struct PressureGate {
    level: AtomicU8,
}

impl PressureGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    pub fn set(&self, level: PressureLevel) {
        self.level.store(level.as_u8(), Ordering::Release);
    }

    pub fn options(&self, requested: AnalysisOptions) -> AnalysisOptions {
        self.level().degrade(requested)
    }
}

pub struct ResourceGovernor {
    probe: Box<dyn ResourceProbe>,
    pool: Arc<BufferPool>,
    gate: Arc<PressureGate>,
    latency: Arc<LatencyTracker>,
    feed: Arc<Feed>,
    config: GovernorConfig,
    calm: u32,
}

impl ResourceGovernor {
    pub fn new(probe: Box<dyn ResourceProbe>, ctx: &AnalysisContext) -> Self {
        Self {
            probe,
            pool: ctx.pool.clone(),
            gate: ctx.gate.clone(),
            latency: ctx.latency.clone(),
            feed: ctx.feed.clone(),
            config: ctx.config.governor.clone(),
            calm: 0,
        }
    }

    pub fn level(&self) -> PressureLevel {
        self.gate.level()
    }

    /// Level implied by a usage ratio, before debouncing.
    pub fn classify(&self, ratio: f32) -> PressureLevel {
        if ratio >= self.config.critical_ratio {
            PressureLevel::Critical
        } else if ratio >= self.config.elevated_ratio {
            PressureLevel::Elevated
        } else {
            PressureLevel::Normal
        }
    }

    /// Takes one sample and applies the resulting level.
    pub fn sample_once(&mut self) -> Result<PressureLevel> {
        let sample = self.probe.sample()?;
        let memory_ratio = if self.config.memory_ceiling_bytes > 0 {
            sample.memory_bytes as f64 / self.config.memory_ceiling_bytes as f64
        } else {
            0.0
        };
        let latency_ratio = match (self.latency.take_window(), self.config.latency_budget_ms) {
            (Some(mean), budget) if budget > 0 => mean.as_secs_f64() * 1000.0 / budget as f64,
            _ => 0.0,
        };
        let ratio = memory_ratio.max(latency_ratio) as f32;
        let target = self.classify(ratio);
        let current = self.gate.level();

        let next = if target > current {
            self.calm = 0;
            target
        } else if target < current {
            self.calm += 1;
            if self.calm >= self.config.recovery_debounce.max(1) {
                self.calm = 0;
                target
            } else {
                current
            }
        } else {
            self.calm = 0;
            current
        };

        if next == PressureLevel::Critical {
            // Repeated on every critical sample while the pressure lasts.
            let freed = self.pool.release_all();
            let leaked = self
                .pool
                .collect_leaked(Duration::from_millis(self.config.leak_age_ms));
            if freed > 0 || leaked > 0 {
                log::debug!(
                    "Critical pressure: freed {} idle bytes, reclaimed {} leaked bytes",
                    freed,
                    leaked
                );
            }
        }

        if next != current {
            self.transition(current, next);
            self.gate.set(next);
            self.feed.publish(PipelineEvent::Pressure(PressureEvent {
                level: next,
                previous: current,
                ratio,
                memory_bytes: sample.memory_bytes,
                cpu_percent: sample.cpu_percent,
                pool_bytes: self.pool.tracked_bytes(),
                timestamp_ms: unix_millis(),
            }));
            if next > current {
                log::warn!(
                    "Resource pressure {:?} -> {:?} (ratio {:.2}, {} MB resident, cpu {:.0}%)",
                    current,
                    next,
                    ratio,
                    sample.memory_bytes / (1024 * 1024),
                    sample.cpu_percent
                );
            } else {
                log::info!("Resource pressure recovered {:?} -> {:?}", current, next);
            }
        }
        Ok(next)
    }

    fn transition(&self, from: PressureLevel, to: PressureLevel) {
        match (from, to) {
            (PressureLevel::Normal, PressureLevel::Elevated | PressureLevel::Critical) => {
                self.pool.reduce_size();
            }
            (_, PressureLevel::Normal) => self.pool.restore_size(),
            _ => {}
        }
    }

    /// Runs the governor on its own thread until the handle is stopped or
    /// dropped.
    pub fn spawn(mut self) -> Result<GovernorHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = Duration::from_millis(self.config.sample_interval_ms.max(1));
        let thread = thread::Builder::new()
            .name("resource-governor".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = self.sample_once() {
                            log::debug!("Resource sample failed: {}", e);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(GovernorHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

pub struct GovernorHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl GovernorHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for GovernorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
