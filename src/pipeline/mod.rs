//! Capture → analysis → publish.
//!
//! The capture side ([`CaptureHandle`]) only copies samples into a pooled
//! buffer and offers it to a bounded queue; a full queue hands the buffer
//! straight back to the pool. A single worker thread drains the queue in
//! capture order, runs the analysis chain and publishes to the [`Feed`].

pub mod cache;
pub mod checkpoint;
pub mod feed;
pub mod file;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;

use crate::analysis::aggregate::FeatureAggregator;
use crate::analysis::features::AudioFeatures;
use crate::analysis::spectral::SpectralAnalyzer;
use crate::analysis::time_domain::TimeDomainStats;
use crate::audio::buffer::{AudioBuffer, BufferFormat};
use crate::audio::pool::BufferPool;
use crate::config::Config;
use crate::error::{AnalysisError, ErrorKind, Result};
use crate::governor::{LatencyTracker, PressureGate};
use crate::mood::model::MoodModel;
use crate::mood::{MoodClassifier, MoodSnapshot};
use crate::options::AnalysisOptions;

use cache::ResultCache;
use feed::{Feed, PipelineEvent, SnapshotCell};

/// How often an idle worker re-checks for cancellation.
const WORKER_POLL: Duration = Duration::from_millis(20);

/// Shared services for one analysis session, passed explicitly to every
/// component that needs them.
#[derive(Clone)]
pub struct AnalysisContext {
    pub config: Config,
    pub pool: Arc<BufferPool>,
    pub feed: Arc<Feed>,
    pub gate: Arc<PressureGate>,
    pub latency: Arc<LatencyTracker>,
    pub cache: Arc<ResultCache>,
    pub features: Arc<SnapshotCell<AudioFeatures>>,
    pub mood: Arc<SnapshotCell<MoodSnapshot>>,
}

impl AnalysisContext {
    pub fn new(config: Config) -> Self {
        Self {
            pool: Arc::new(BufferPool::new(config.pool.clone())),
            feed: Arc::new(Feed::new()),
            gate: Arc::new(PressureGate::new()),
            latency: Arc::new(LatencyTracker::new()),
            cache: Arc::new(ResultCache::new(config.analysis.cache_capacity)),
            features: Arc::new(SnapshotCell::empty()),
            mood: Arc::new(SnapshotCell::new(MoodSnapshot::initial())),
            config,
        }
    }

    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        self.feed.subscribe()
    }

    pub fn latest_features(&self) -> Option<Arc<AudioFeatures>> {
        self.features.load()
    }

    pub fn current_mood(&self) -> Option<Arc<MoodSnapshot>> {
        self.mood.load()
    }
}

/// Flags shared by capture handles, the worker and `stop`.
#[derive(Default)]
struct SessionState {
    cancelled: AtomicBool,
    in_flight: AtomicUsize,
    accepted: AtomicU64,
    dropped: AtomicU64,
    flushed: AtomicU64,
    /// Held while publishing so `stop` can fence off late results.
    publish: Mutex<()>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Real-time side of a running [`Pipeline`]. Cheap to clone.
///
/// Pushing never blocks on analysis and never allocates once the pool is
/// warm: a buffer is taken from the pool, filled, and offered to the queue.
#[derive(Clone)]
pub struct CaptureHandle {
    queue: Sender<AudioBuffer>,
    pool: Arc<BufferPool>,
    state: Arc<SessionState>,
    format: BufferFormat,
}

impl CaptureHandle {
    pub fn format(&self) -> BufferFormat {
        self.format
    }

    /// Interleaved f32 samples, `frames * channels` long.
    pub fn push_interleaved(&self, samples: &[f32]) -> Result<bool> {
        let frames = samples.len() / self.format.channels.max(1) as usize;
        self.fill_and_push(frames, |buf| buf.write_interleaved(samples))
    }

    pub fn push_i16(&self, samples: &[i16]) -> Result<bool> {
        let frames = samples.len() / self.format.channels.max(1) as usize;
        self.fill_and_push(frames, |buf| buf.write_interleaved_i16(samples))
    }

    pub fn push_i32(&self, samples: &[i32]) -> Result<bool> {
        let frames = samples.len() / self.format.channels.max(1) as usize;
        self.fill_and_push(frames, |buf| buf.write_interleaved_i32(samples))
    }

    /// One slice per channel.
    pub fn push_planar(&self, planes: &[&[f32]]) -> Result<bool> {
        let frames = planes.first().map_or(0, |p| p.len());
        self.fill_and_push(frames, |buf| buf.write_planar(planes))
    }

    /// Checks out an empty buffer for callers that fill it themselves.
    pub fn acquire(&self, frames: usize) -> Result<AudioBuffer> {
        self.pool.acquire_quiet(self.format, frames)
    }

    /// Offers a filled buffer to the analysis queue. Returns `false` when it
    /// was not queued (pipeline stopped or queue full); the buffer is then
    /// back in the pool.
    pub fn push(&self, buffer: AudioBuffer) -> bool {
        let _guard = self.enter();
        self.offer(buffer)
    }

    /// Buffers refused because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    fn enter(&self) -> InFlight<'_> {
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(&self.state.in_flight)
    }

    fn fill_and_push(
        &self,
        frames: usize,
        fill: impl FnOnce(&mut AudioBuffer) -> Result<usize>,
    ) -> Result<bool> {
        let _guard = self.enter();
        if self.state.cancelled.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if frames == 0 {
            return Err(AnalysisError::InsufficientAudioData("empty capture buffer".into()));
        }
        let mut buffer = self.pool.acquire_quiet(self.format, frames)?;
        if let Err(e) = fill(&mut buffer) {
            self.pool.release(buffer);
            return Err(e);
        }
        Ok(self.offer(buffer))
    }

    fn offer(&self, buffer: AudioBuffer) -> bool {
        if self.state.cancelled.load(Ordering::SeqCst) {
            self.pool.release(buffer);
            return false;
        }
        match self.queue.try_send(buffer) {
            Ok(()) => {
                self.state.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(buffer)) => {
                self.state.dropped.fetch_add(1, Ordering::Relaxed);
                self.pool.release(buffer);
                false
            }
            Err(TrySendError::Disconnected(buffer)) => {
                self.pool.release(buffer);
                false
            }
        }
    }
}

/// Counters returned by [`Pipeline::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StopReport {
    pub accepted: u64,
    pub processed: u64,
    pub dropped: u64,
    /// Queued buffers returned to the pool unprocessed
    pub flushed: u64,
    pub failed: u64,
    pub mean_latency_ms: f64,
    pub max_latency_ms: f64,
    pub final_mood: MoodSnapshot,
}

struct Worker {
    ctx: AnalysisContext,
    state: Arc<SessionState>,
    analyzer: SpectralAnalyzer,
    aggregator: FeatureAggregator,
    classifier: MoodClassifier,
    options: AnalysisOptions,
    processed: u64,
    failed: u64,
    since_inference: u32,
}

impl Worker {
    fn run(mut self, queue: Receiver<AudioBuffer>) -> Self {
        log::debug!("Analysis worker started ({:?})", self.options);
        loop {
            if self.state.cancelled.load(Ordering::SeqCst) {
                break;
            }
            match queue.recv_timeout(WORKER_POLL) {
                Ok(buffer) => {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(&buffer)));
                    self.ctx.pool.release(buffer);
                    if let Err(payload) = outcome {
                        self.recover(payload);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::debug!("Analysis worker exiting after {} buffers", self.processed);
        self
    }

    /// Analyzes one buffer; the caller returns it to the pool.
    fn process(&mut self, buffer: &AudioBuffer) {
        if self.state.cancelled.load(Ordering::SeqCst) {
            self.state.flushed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let started = Instant::now();
        let state = Arc::clone(&self.state);
        let options = self.ctx.gate.options(self.options);
        let format = buffer.format();

        let spectral = match self.analyzer.process(buffer) {
            Ok(spectral) => spectral,
            Err(e) => {
                let _publish = state.publish.lock().unwrap_or_else(|e| e.into_inner());
                self.fail(e);
                return;
            }
        };
        let mono = self.analyzer.mono();
        let stats = TimeDomainStats::from_samples(mono);
        self.aggregator
            .observe(mono, &format, &spectral, self.analyzer.spectrum(), options);
        let features = Arc::new(self.aggregator.derive(&spectral, &stats, options));
        self.processed += 1;

        {
            let _publish = state.publish.lock().unwrap_or_else(|e| e.into_inner());
            if !state.cancelled.load(Ordering::SeqCst) {
                self.ctx.features.store(features.clone());
                self.ctx.feed.publish(PipelineEvent::Features(features.clone()));
                if options.contains(AnalysisOptions::MOOD) {
                    self.classify(&features);
                }
            }
        }
        self.ctx.latency.record(started.elapsed());
    }

    /// A panic inside the analysis chain costs one buffer, not the session.
    /// Streaming state is dropped since it may be half-updated.
    fn recover(&mut self, payload: Box<dyn Any + Send>) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        log::error!("Analysis worker recovered from panic: {}", message);
        self.analyzer.reset();
        self.aggregator.reset();
        let state = Arc::clone(&self.state);
        let _publish = state.publish.lock().unwrap_or_else(|e| e.into_inner());
        self.fail(AnalysisError::BufferProcessingFailed(format!("analysis panicked: {}", message)));
    }

    fn classify(&mut self, features: &AudioFeatures) {
        self.since_inference += 1;
        if self.since_inference < self.ctx.gate.level().classifier_stride() {
            return;
        }
        self.since_inference = 0;
        match self.classifier.infer(features) {
            Ok(inference) if inference.transitioned => {
                self.ctx.mood.store(Arc::new(inference.current));
                self.ctx.feed.publish(PipelineEvent::MoodChanged(inference.current));
            }
            Ok(_) => {}
            Err(e) => {
                if e.kind() == ErrorKind::ModelLoadFailed {
                    self.ctx.mood.store(Arc::new(self.classifier.current()));
                }
                self.fail(e);
            }
        }
    }

    /// Caller holds the publish lock.
    fn fail(&mut self, err: AnalysisError) {
        if matches!(err, AnalysisError::InsufficientAudioData(_)) {
            log::trace!("Skipping buffer: {}", err);
            return;
        }
        self.failed += 1;
        log::debug!("Buffer analysis failed: {}", err);
        if !self.state.cancelled.load(Ordering::SeqCst) {
            self.ctx.feed.publish(PipelineEvent::error(&err));
        }
    }
}

/// A running capture/analysis session.
pub struct Pipeline {
    ctx: AnalysisContext,
    state: Arc<SessionState>,
    queue_tx: Sender<AudioBuffer>,
    queue_rx: Receiver<AudioBuffer>,
    worker: Option<JoinHandle<Worker>>,
    report: Option<StopReport>,
}

impl Pipeline {
    /// Starts the analysis worker. `model` is loaded lazily on the first
    /// classification.
    pub fn start(
        ctx: AnalysisContext,
        model: Box<dyn MoodModel>,
        options: AnalysisOptions,
        sample_rate: u32,
    ) -> Result<Self> {
        let depth = ctx.config.analysis.queue_depth.max(1);
        let (queue_tx, queue_rx) = bounded::<AudioBuffer>(depth);
        let state = Arc::new(SessionState::default());
        let worker = Worker {
            analyzer: SpectralAnalyzer::from_config(&ctx.config.analysis),
            aggregator: FeatureAggregator::new(sample_rate),
            classifier: MoodClassifier::new(model, ctx.config.classifier.clone()),
            ctx: ctx.clone(),
            state: state.clone(),
            options,
            processed: 0,
            failed: 0,
            since_inference: 0,
        };
        let rx = queue_rx.clone();
        let handle = thread::Builder::new()
            .name("analysis-worker".to_string())
            .spawn(move || worker.run(rx))?;
        log::info!(
            "Pipeline started (queue depth {}, {:?})",
            depth,
            options
        );
        Ok(Self {
            ctx,
            state,
            queue_tx,
            queue_rx,
            worker: Some(handle),
            report: None,
        })
    }

    pub fn context(&self) -> &AnalysisContext {
        &self.ctx
    }

    /// A capture handle for `format`; pre-warms the pool with enough
    /// buffers of `frames` to fill the queue.
    pub fn capture(&self, format: BufferFormat, frames: usize) -> Result<CaptureHandle> {
        format.validate()?;
        let warm = self.ctx.config.analysis.queue_depth + 2;
        self.ctx.pool.prewarm(format, frames, warm)?;
        Ok(CaptureHandle {
            queue: self.queue_tx.clone(),
            pool: self.ctx.pool.clone(),
            state: self.state.clone(),
            format,
        })
    }

    /// Buffers waiting for the worker.
    pub fn backlog(&self) -> usize {
        self.queue_rx.len()
    }

    /// Stops the session: no results are published after this returns,
    /// queued buffers go back to the pool, and the classifier's smoothing
    /// history is cleared.
    pub fn stop(mut self) -> StopReport {
        self.shutdown()
    }

    fn shutdown(&mut self) -> StopReport {
        if let Some(report) = self.report {
            return report;
        }
        {
            let _publish = self.state.publish.lock().unwrap_or_else(|e| e.into_inner());
            self.state.cancelled.store(true, Ordering::SeqCst);
        }
        while self.state.in_flight.load(Ordering::SeqCst) > 0 {
            thread::yield_now();
        }

        let (processed, failed, final_mood) = match self.worker.take().map(JoinHandle::join) {
            Some(Ok(mut worker)) => {
                worker.classifier.reset();
                worker.aggregator.reset();
                worker.analyzer.reset();
                (worker.processed, worker.failed, worker.classifier.current())
            }
            Some(Err(_)) => {
                log::error!("Analysis worker panicked");
                (0, 0, MoodSnapshot::initial())
            }
            None => (0, 0, MoodSnapshot::initial()),
        };

        let mut flushed = self.state.flushed.load(Ordering::Relaxed);
        while let Ok(buffer) = self.queue_rx.try_recv() {
            self.ctx.pool.release(buffer);
            flushed += 1;
        }

        let latency = &self.ctx.latency;
        let report = StopReport {
            accepted: self.state.accepted.load(Ordering::Relaxed),
            processed,
            dropped: self.state.dropped.load(Ordering::Relaxed),
            flushed,
            failed,
            mean_latency_ms: latency.mean().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
            max_latency_ms: latency.max().as_secs_f64() * 1000.0,
            final_mood,
        };
        log::info!(
            "Pipeline stopped: {} processed, {} dropped, {} flushed",
            report.processed,
            report.dropped,
            report.flushed
        );
        self.report = Some(report);
        report
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
