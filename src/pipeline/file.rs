use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use super::cache::SourceId;
use super::checkpoint::{Checkpoint, Checkpointer};
use super::feed::PipelineEvent;
use super::AnalysisContext;
use crate::analysis::aggregate::FeatureAggregator;
use crate::analysis::features::{AudioFeatures, SpectralFeatures};
use crate::analysis::spectral::{spectral_flux, SpectralAnalyzer, Spectrum};
use crate::analysis::time_domain::TimeDomainStats;
use crate::audio::buffer::BufferFormat;
use crate::audio::decode::decode_file;
use crate::error::{AnalysisError, Result};
use crate::mood::classifier::Inference;
use crate::mood::model::MoodModel;
use crate::mood::MoodClassifier;
use crate::options::AnalysisOptions;

/// Chunks analyzed in parallel between progress and timeout checks.
const BATCH_CHUNKS: usize = 64;

#[derive(Debug, Clone)]
pub struct FileAnalysis {
    pub source: SourceId,
    pub features: Arc<AudioFeatures>,
    pub mood: Option<Inference>,
    /// Answered from the result cache
    pub cached: bool,
    /// Progress fraction of the checkpoint this run resumed from
    pub resumed_from: Option<f32>,
    pub chunks: usize,
}

/// Spectral pass over one chunk, computed off the ordered path.
struct ChunkSpectrum {
    features: SpectralFeatures,
    magnitudes: Vec<f32>,
    power: Vec<f32>,
    bin_hz: f32,
}

/// Whole-file analysis: decode, chunk, aggregate, classify.
///
/// Chunk spectra are computed in parallel batches; flux, onsets, chroma and
/// loudness are then fed in chunk order so the result matches a streaming
/// pass over the same audio.
pub struct FileAnalyzer {
    ctx: AnalysisContext,
    options: AnalysisOptions,
    classifier: MoodClassifier,
    timeout: Option<Duration>,
    checkpointer: Option<Checkpointer>,
    resume: bool,
    progress: Option<Box<dyn Fn(f32) + Send>>,
}

impl FileAnalyzer {
    pub fn new(ctx: AnalysisContext, model: Box<dyn MoodModel>, options: AnalysisOptions) -> Self {
        let classifier = MoodClassifier::new(model, ctx.config.classifier.clone());
        Self {
            ctx,
            options,
            classifier,
            timeout: None,
            checkpointer: None,
            resume: false,
            progress: None,
        }
    }

    /// Give up with `AnalysisTimeout` once `timeout` has elapsed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Checkpointer) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Continue from a saved checkpoint when one exists for the source.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Called with the completed fraction after every batch.
    pub fn on_progress(mut self, f: impl Fn(f32) + Send + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn classifier(&self) -> &MoodClassifier {
        &self.classifier
    }

    pub fn analyze_file(&mut self, path: &Path) -> Result<FileAnalysis> {
        let audio = decode_file(path)?;
        self.analyze_samples(&audio.samples, audio.sample_rate, audio.channels)
    }

    /// Analyzes a mono signal. `channels` is only reported back.
    pub fn analyze_samples(&mut self, mono: &[f32], sample_rate: u32, channels: u16) -> Result<FileAnalysis> {
        BufferFormat::new(sample_rate, channels.max(1)).validate()?;
        if mono.is_empty() {
            return Err(AnalysisError::InsufficientAudioData("no samples".into()));
        }
        let options = self.ctx.gate.options(self.options);
        let source = SourceId::from_samples(mono, sample_rate);
        let key = source.key();

        if options.contains(AnalysisOptions::CACHING) {
            if let Some(features) = self.ctx.cache.get(source, options) {
                log::debug!("Result cache hit for {}", source);
                let mood = self.classify(&features, options)?;
                return Ok(FileAnalysis {
                    source,
                    features,
                    mood,
                    cached: true,
                    resumed_from: None,
                    chunks: 0,
                });
            }
        }

        let mut chunk = self.ctx.config.analysis.chunk_frames.max(64);
        if options.contains(AnalysisOptions::HIGH_PRECISION) {
            chunk *= 2;
        }
        let total = mono.len().div_ceil(chunk);

        let mut start_chunk = 0;
        let mut prior: Option<AudioFeatures> = None;
        if self.resume {
            if let Some(cp) = self.load_checkpoint(&key) {
                start_chunk = ((cp.progress * total as f32).round() as usize).min(total);
                log::info!(
                    "Resuming {} from {:.0}% (chunk {}/{})",
                    source,
                    cp.progress * 100.0,
                    start_chunk,
                    total
                );
                prior = Some(cp.features);
            }
        }
        let resumed_from = prior.as_ref().map(|_| start_chunk as f32 / total as f32);

        let started = Instant::now();
        let config = self.ctx.config.analysis.clone();
        let format = BufferFormat::new(sample_rate, channels.max(1));
        let mut aggregator = FeatureAggregator::new(sample_rate);
        let mut frames: Vec<SpectralFeatures> = Vec::with_capacity(total - start_chunk);
        let mut prev_magnitudes: Option<Vec<f32>> = None;
        let chunk_at = |i: usize| &mono[i * chunk..((i + 1) * chunk).min(mono.len())];

        let mut next = start_chunk;
        while next < total {
            let end = (next + BATCH_CHUNKS).min(total);
            let spectra: Vec<Option<ChunkSpectrum>> = (next..end)
                .into_par_iter()
                .map_init(
                    || SpectralAnalyzer::from_config(&config),
                    |analyzer, i| match analyzer.analyze_frame(chunk_at(i), sample_rate) {
                        Ok(features) => {
                            let spectrum = analyzer.spectrum();
                            Ok(Some(ChunkSpectrum {
                                features,
                                magnitudes: analyzer.frame_magnitudes().to_vec(),
                                power: spectrum.power.to_vec(),
                                bin_hz: spectrum.bin_hz,
                            }))
                        }
                        Err(AnalysisError::InsufficientAudioData(_)) => Ok(None),
                        Err(e) => Err(e),
                    },
                )
                .collect::<Result<_>>()?;

            for (i, spectrum) in (next..end).zip(spectra) {
                let samples = chunk_at(i);
                match spectrum {
                    Some(mut cs) => {
                        cs.features.flux = match &prev_magnitudes {
                            Some(prev) if prev.len() == cs.magnitudes.len() => spectral_flux(prev, &cs.magnitudes),
                            _ => 0.0,
                        };
                        let view = Spectrum {
                            power: &cs.power,
                            bin_hz: cs.bin_hz,
                        };
                        aggregator.observe(samples, &format, &cs.features, view, options);
                        frames.push(cs.features);
                        prev_magnitudes = Some(cs.magnitudes);
                    }
                    None => {
                        let silent = Spectrum { power: &[], bin_hz: 0.0 };
                        aggregator.observe(samples, &format, &SpectralFeatures::default(), silent, options);
                    }
                }
            }
            next = end;
            let progress = next as f32 / total as f32;
            if let Some(report) = &self.progress {
                report(progress);
            }
            if next >= total {
                break;
            }

            let partial = |aggregator: &mut FeatureAggregator| {
                partial_features(aggregator, &frames, &mono[start_chunk * chunk..next * chunk], options, prior.as_ref(), start_chunk, next)
            };
            if let Some(checkpointer) = &self.checkpointer {
                checkpointer.maybe_save(|| {
                    partial(&mut aggregator).map(|features| Checkpoint::new(key.clone(), progress, features))
                });
            }
            if let Some(timeout) = self.timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    if let (Some(checkpointer), Some(features)) = (&self.checkpointer, partial(&mut aggregator)) {
                        if let Err(e) = checkpointer.force(Checkpoint::new(key.clone(), progress, features)) {
                            log::warn!("Could not checkpoint {} before timing out: {}", source, e);
                        }
                    }
                    log::warn!("Analysis of {} timed out at {:.0}%", source, progress * 100.0);
                    return Err(AnalysisError::AnalysisTimeout {
                        elapsed_ms: elapsed.as_millis().min(u64::MAX as u128) as u64,
                        progress,
                    });
                }
            }
        }

        let analyzed = &mono[(start_chunk * chunk).min(mono.len())..];
        let features = match partial_features(&mut aggregator, &frames, analyzed, options, prior.as_ref(), start_chunk, total) {
            Some(features) => features,
            None => {
                return Err(AnalysisError::InsufficientAudioData(format!(
                    "{} contains no audible content",
                    source
                )))
            }
        };
        let features = Arc::new(features);
        log::debug!(
            "Analyzed {} chunks of {} in {:.0}ms",
            total - start_chunk,
            source,
            started.elapsed().as_secs_f64() * 1000.0
        );

        if let Some(checkpointer) = &self.checkpointer {
            if let Err(e) = checkpointer.clear(&key) {
                log::warn!("Could not clear checkpoint for {}: {}", source, e);
            }
        }
        if options.contains(AnalysisOptions::CACHING) {
            self.ctx.cache.insert(source, options, features.clone());
        }
        self.ctx.features.store(features.clone());
        self.ctx.feed.publish(PipelineEvent::Features(features.clone()));

        let mood = self.classify(&features, options)?;
        Ok(FileAnalysis {
            source,
            features,
            mood,
            cached: false,
            resumed_from,
            chunks: total,
        })
    }

    fn load_checkpoint(&self, key: &str) -> Option<Checkpoint> {
        let checkpointer = self.checkpointer.as_ref()?;
        match checkpointer.load(key) {
            Ok(Some(cp)) if cp.progress > 0.0 && cp.progress < 1.0 => Some(cp),
            Ok(_) => None,
            Err(e) => {
                log::warn!("Ignoring unreadable checkpoint {}: {}", key, e);
                None
            }
        }
    }

    fn classify(&mut self, features: &AudioFeatures, options: AnalysisOptions) -> Result<Option<Inference>> {
        if !options.contains(AnalysisOptions::MOOD) {
            return Ok(None);
        }
        let inference = self.classifier.infer(features)?;
        if inference.transitioned {
            self.ctx.mood.store(Arc::new(inference.current));
            self.ctx.feed.publish(PipelineEvent::MoodChanged(inference.current));
        }
        Ok(Some(inference))
    }
}

/// Features for chunks `[start, done)`, joined with the checkpointed prefix
/// `[0, start)` when there is one.
fn partial_features(
    aggregator: &mut FeatureAggregator,
    frames: &[SpectralFeatures],
    analyzed: &[f32],
    options: AnalysisOptions,
    prior: Option<&AudioFeatures>,
    start: usize,
    done: usize,
) -> Option<AudioFeatures> {
    let fresh = SpectralFeatures::average(frames).map(|spectral| {
        let stats = TimeDomainStats::from_samples(analyzed);
        aggregator.derive(&spectral, &stats, options)
    });
    match (prior, fresh) {
        (Some(prior), Some(fresh)) if done > 0 => {
            Some(prior.blend(&fresh, (done - start) as f32 / done as f32))
        }
        (Some(prior), _) => Some(prior.clone()),
        (None, fresh) => fresh,
    }
}
