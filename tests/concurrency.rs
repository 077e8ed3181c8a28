mod common;

use std::sync::Arc;
use std::thread;

use moodscope::analysis::SpectralAnalyzer;
use moodscope::mood::model::PrototypeModel;
use moodscope::pipeline::checkpoint::{Checkpointer, MemoryCheckpointStore};
use moodscope::{AnalysisContext, AnalysisOptions, BufferFormat, Config, FileAnalyzer};

const TASKS: usize = 10;
const CEILING: usize = 50 * 1024 * 1024;

fn context() -> AnalysisContext {
    let mut config = Config::default();
    config.pool.memory_ceiling_bytes = CEILING;
    config.pool.max_idle_buffers = 4;
    AnalysisContext::new(config)
}

#[test]
fn ten_concurrent_tasks_stay_under_the_ceiling_and_return_to_baseline() {
    let ctx = context();
    let baseline = ctx.pool.tracked_bytes();
    let frames = 5 * common::SAMPLE_RATE as usize;

    let handles: Vec<_> = (0..TASKS)
        .map(|task| {
            let ctx = ctx.clone();
            thread::spawn(move || {
                let samples = common::sine(150.0 + 40.0 * task as f32, 5.0, 0.5);
                let format = BufferFormat::mono(common::SAMPLE_RATE);
                let mut buffer = ctx.pool.acquire(format, frames).unwrap();
                buffer.write_interleaved(&samples).unwrap();

                let mut analyzer = SpectralAnalyzer::from_config(&ctx.config.analysis);
                let spectral = analyzer.process(&buffer).unwrap();
                assert!(spectral.centroid > 0.0);
                ctx.pool.release(buffer);

                let mut file = FileAnalyzer::new(
                    ctx.clone(),
                    Box::new(PrototypeModel::new(0.03)),
                    AnalysisOptions::STANDARD,
                );
                let result = file.analyze_samples(&samples, common::SAMPLE_RATE, 1).unwrap();
                assert!(result.features.in_range());
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = ctx.pool.stats();
    assert!(stats.peak_tracked_bytes <= CEILING, "peak {}", stats.peak_tracked_bytes);
    assert_eq!(stats.outstanding, 0);

    ctx.pool.release_all();
    let after = ctx.pool.tracked_bytes();
    assert!(after as f64 <= baseline as f64 * 1.2, "baseline {} after {}", baseline, after);
}

#[test]
fn ceiling_holds_when_tasks_outnumber_capacity() {
    let mut config = Config::default();
    // Room for four 5-second mono buffers.
    config.pool.memory_ceiling_bytes = 4 * 5 * common::SAMPLE_RATE as usize * 4;
    let ctx = AnalysisContext::new(config);
    let ceiling = ctx.pool.ceiling();

    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let pool = ctx.pool.clone();
            thread::spawn(move || {
                let format = BufferFormat::mono(common::SAMPLE_RATE);
                for _ in 0..20 {
                    if let Ok(buf) = pool.acquire(format, 5 * common::SAMPLE_RATE as usize) {
                        assert!(pool.tracked_bytes() <= ceiling);
                        thread::yield_now();
                        pool.release(buf);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(ctx.pool.stats().peak_tracked_bytes <= ceiling);
    assert_eq!(ctx.pool.stats().outstanding, 0);
}

#[test]
fn concurrent_file_analyses_share_checkpoint_store() {
    let ctx = context();
    let store = Arc::new(MemoryCheckpointStore::new());
    let handles: Vec<_> = (0..4)
        .map(|task| {
            let ctx = ctx.clone();
            let store = store.clone();
            thread::spawn(move || {
                let samples = common::sine(200.0 * (task + 1) as f32, 2.0, 0.4);
                let mut file = FileAnalyzer::new(ctx, Box::new(PrototypeModel::new(0.03)), AnalysisOptions::QUICK)
                    .with_checkpointer(Checkpointer::new(store, std::time::Duration::from_secs(60)))
                    .with_resume(true);
                file.analyze_samples(&samples, common::SAMPLE_RATE, 1).unwrap().source
            })
        })
        .collect();
    let mut sources: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    sources.sort_by_key(|s| s.0);
    sources.dedup();
    assert_eq!(sources.len(), 4);
}
