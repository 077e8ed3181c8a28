mod common;

use std::thread;
use std::time::{Duration, Instant};

use moodscope::analysis::{FeatureAggregator, SpectralAnalyzer, TimeDomainStats};
use moodscope::mood::model::PrototypeModel;
use moodscope::{AnalysisContext, AnalysisOptions, BufferFormat, Config, Pipeline};

const ITERATIONS: usize = 50;
const FRAMES: usize = 4096;
const BUDGET: Duration = Duration::from_millis(100);

fn buffer(i: usize) -> Vec<f32> {
    let freq = 80.0 * 1.09f32.powi(i as i32);
    let mut noise = common::XorShift::new(i as u64 + 7);
    (0..FRAMES)
        .map(|n| {
            let t = n as f32 / common::SAMPLE_RATE as f32;
            0.5 * (2.0 * std::f32::consts::PI * freq * t).sin() + 0.05 * noise.next()
        })
        .collect()
}

#[test]
fn mean_buffer_latency_is_within_budget() {
    let format = BufferFormat::mono(common::SAMPLE_RATE);
    let options = AnalysisOptions::COMPREHENSIVE;
    let mut analyzer = SpectralAnalyzer::new(16384, 0.85);
    let mut aggregator = FeatureAggregator::new(common::SAMPLE_RATE);
    let inputs: Vec<Vec<f32>> = (0..ITERATIONS).map(buffer).collect();

    let mut total = Duration::ZERO;
    for samples in &inputs {
        let started = Instant::now();
        let spectral = analyzer.process_samples(samples, common::SAMPLE_RATE).unwrap();
        let stats = TimeDomainStats::from_samples(samples);
        aggregator.observe(samples, &format, &spectral, analyzer.spectrum(), options);
        let features = aggregator.derive(&spectral, &stats, options);
        total += started.elapsed();
        assert!(features.in_range());
    }
    let mean = total / ITERATIONS as u32;
    assert!(mean < BUDGET, "mean latency {:?}", mean);
}

#[test]
fn pipeline_reports_latency_within_budget() {
    let ctx = AnalysisContext::new(Config::default());
    let pipeline = Pipeline::start(
        ctx.clone(),
        Box::new(PrototypeModel::new(0.03)),
        AnalysisOptions::COMPREHENSIVE,
        common::SAMPLE_RATE,
    )
    .unwrap();
    let capture = pipeline.capture(BufferFormat::mono(common::SAMPLE_RATE), FRAMES).unwrap();

    // Pace at real time so nothing is dropped.
    let period = Duration::from_secs_f32(FRAMES as f32 / common::SAMPLE_RATE as f32 / 8.0);
    let mut accepted = 0;
    for i in 0..ITERATIONS {
        let drained_by = Instant::now() + Duration::from_secs(5);
        while pipeline.backlog() >= ctx.config.analysis.queue_depth {
            assert!(Instant::now() < drained_by, "worker stopped draining at buffer {}", i);
            thread::sleep(Duration::from_millis(1));
        }
        if capture.push_interleaved(&buffer(i)).unwrap() {
            accepted += 1;
        }
        thread::sleep(period);
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while ctx.latency.count() < accepted && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let report = pipeline.stop();
    assert_eq!(report.accepted, accepted);
    assert_eq!(report.processed, accepted);
    assert!(report.mean_latency_ms < BUDGET.as_secs_f64() * 1000.0, "{:?}", report);
    assert_eq!(ctx.pool.stats().outstanding, 0);
}
