mod cli;

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use cli::{Cli, OutputFormat};
use moodscope::audio::decode_file;
use moodscope::config::{self, Config};
use moodscope::governor::{ResourceGovernor, SystemProbe};
use moodscope::mood::model::{MoodModel, PrototypeModel};
use moodscope::mood::Inference;
use moodscope::pipeline::checkpoint::{Checkpointer, FileCheckpointStore};
use moodscope::pipeline::feed::PipelineEvent;
use moodscope::{AnalysisContext, AnalysisOptions, AudioFeatures, BufferFormat, FileAnalysis, FileAnalyzer, Mood, Pipeline};

#[derive(Serialize)]
struct MoodReport {
    mood: Mood,
    confidence: f32,
    candidate: Mood,
    candidate_confidence: f32,
}

impl From<&Inference> for MoodReport {
    fn from(inf: &Inference) -> Self {
        Self {
            mood: inf.current.mood,
            confidence: inf.current.confidence,
            candidate: inf.candidate,
            candidate_confidence: inf.confidence,
        }
    }
}

#[derive(Serialize)]
struct FileReport<'a> {
    source: String,
    key: String,
    features: &'a AudioFeatures,
    mood: Option<MoodReport>,
    cached: bool,
    resumed_from: Option<f32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut cli = Cli::parse();

    if cli.list_moods {
        for mood in Mood::ALL {
            println!("{}", mood);
        }
        return Ok(());
    }

    let mut cfg = Config::default();
    if let Some(path) = cli.config.clone().or_else(config::find_config) {
        if let Some(loaded) = config::load_config(&path) {
            log::info!("Loaded config from {}", path.display());
            cfg = loaded;
            // Merge: config values apply only when CLI is at its default
            if cli.preset == "comprehensive" { cli.preset = cfg.analysis.preset.clone(); }
            if cli.chunk_frames == 4096 { cli.chunk_frames = cfg.analysis.chunk_frames; }
            if cli.temperature == 0.03 { cli.temperature = cfg.classifier.temperature; }
            if cli.checkpoint_dir.is_none() {
                cli.checkpoint_dir = cfg.checkpoint.directory.clone();
            }
        } else {
            log::warn!("Failed to load config from {}", path.display());
        }
    }
    cfg.analysis.chunk_frames = cli.chunk_frames;
    cfg.classifier.temperature = cli.temperature;

    let options: AnalysisOptions = cli
        .preset
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .with_context(|| format!("Invalid preset '{}'", cli.preset))?;
    if options.is_empty() {
        anyhow::bail!("Preset '{}' enables no analysis stages", cli.preset);
    }

    let input = cli.input.as_ref().context("Input audio file is required")?;
    if !input.exists() {
        anyhow::bail!("Input file not found: {}", input.display());
    }

    log::info!("moodscope - audio mood analysis");
    log::info!("Input: {}", input.display());
    log::info!("Stages: {:?}", options);

    let model = build_model(&cli);
    let ctx = AnalysisContext::new(cfg);

    if cli.stream {
        stream(&cli, ctx, model, options, input)
    } else {
        analyze(&cli, ctx, model, options, input)
    }
}

fn build_model(cli: &Cli) -> Box<dyn MoodModel> {
    match &cli.model {
        Some(path) => Box::new(PrototypeModel::from_artifact(path, cli.temperature)),
        None => Box::new(PrototypeModel::new(cli.temperature)),
    }
}

fn progress_bar(len: u64, unit: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "[{{elapsed_precise}}] {{bar:40.cyan/blue}} {{pos}}/{{len}} {} ({{eta}} remaining)",
                unit
            ))?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

fn analyze(
    cli: &Cli,
    ctx: AnalysisContext,
    model: Box<dyn MoodModel>,
    options: AnalysisOptions,
    input: &Path,
) -> Result<()> {
    let interval = Duration::from_secs(ctx.config.checkpoint.interval_secs);
    let mut analyzer = FileAnalyzer::new(ctx, model, options).with_resume(cli.resume);

    let checkpoint_dir = cli
        .checkpoint_dir
        .clone()
        .or_else(FileCheckpointStore::default_dir);
    if let Some(dir) = checkpoint_dir {
        match FileCheckpointStore::new(&dir) {
            Ok(store) => analyzer = analyzer.with_checkpointer(Checkpointer::new(Arc::new(store), interval)),
            Err(e) => log::warn!("Checkpoints disabled, cannot use {}: {}", dir.display(), e),
        }
    }
    if let Some(secs) = cli.timeout_secs {
        analyzer = analyzer.with_timeout(Duration::from_secs(secs));
    }

    let pb = progress_bar(100, "%")?;
    let sink = pb.clone();
    let mut analyzer = analyzer.on_progress(move |p| sink.set_position((p * 100.0) as u64));

    let result = analyzer
        .analyze_file(input)
        .with_context(|| format!("Failed to analyze {}", input.display()));
    pb.finish_and_clear();
    let result = result?;

    log::info!(
        "Duration {:.1}s, {:.0} BPM, {}",
        result.features.duration,
        result.features.tempo,
        result.features.key_signature()
    );
    print_result(&result, cli.format)
}

fn print_result(result: &FileAnalysis, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let report = FileReport {
                source: result.source.to_string(),
                key: result.features.key_signature(),
                features: &result.features,
                mood: result.mood.as_ref().map(MoodReport::from),
                cached: result.cached,
                resumed_from: result.resumed_from,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            let f = &result.features;
            let rows: [(&str, String); 12] = [
                ("energy", format!("{:.3}", f.energy)),
                ("valence", format!("{:.3}", f.valence)),
                ("danceability", format!("{:.3}", f.danceability)),
                ("acousticness", format!("{:.3}", f.acousticness)),
                ("instrumentalness", format!("{:.3}", f.instrumentalness)),
                ("speechiness", format!("{:.3}", f.speechiness)),
                ("liveness", format!("{:.3}", f.liveness)),
                ("tempo", format!("{:.1} BPM", f.tempo)),
                ("key", f.key_signature()),
                ("loudness", format!("{:.1} LUFS", f.loudness)),
                ("duration", format!("{:.1}s", f.duration)),
                ("stages", format!("{:?}", f.stages)),
            ];
            for (name, value) in rows {
                println!("  {:<18} {}", name, value);
            }
            if let Some(inf) = &result.mood {
                println!(
                    "  {:<18} {} ({:.0}%)",
                    "mood",
                    inf.current.mood,
                    inf.current.confidence * 100.0
                );
            }
        }
    }
    Ok(())
}

fn stream(
    cli: &Cli,
    ctx: AnalysisContext,
    model: Box<dyn MoodModel>,
    options: AnalysisOptions,
    input: &Path,
) -> Result<()> {
    let audio = decode_file(input).with_context(|| format!("Failed to decode {}", input.display()))?;
    let frames = ctx.config.analysis.chunk_frames.max(64);
    let depth = ctx.config.analysis.queue_depth.max(1);

    let governor = ResourceGovernor::new(Box::new(SystemProbe::new()), &ctx).spawn()?;
    let events = ctx.subscribe();
    let printer = thread::Builder::new()
        .name("mood-printer".to_string())
        .spawn(move || {
            for event in events {
                match event {
                    PipelineEvent::MoodChanged(s) => {
                        println!("#{:<4} {:<12} {:.0}%", s.sequence, s.mood.name(), s.confidence * 100.0);
                    }
                    PipelineEvent::Pressure(p) => log::warn!("Pressure {:?} (ratio {:.2})", p.level, p.ratio),
                    PipelineEvent::Error { kind, message } => log::warn!("{}: {}", kind.description(), message),
                    PipelineEvent::Features(_) => {}
                }
            }
        })?;

    let pipeline = Pipeline::start(ctx.clone(), model, options, audio.sample_rate)?;
    let capture = pipeline.capture(BufferFormat::mono(audio.sample_rate), frames)?;

    let chunks: Vec<&[f32]> = audio.samples.chunks(frames).collect();
    let pb = progress_bar(chunks.len() as u64, "buffers")?;
    for chunk in &chunks {
        // Pace the producer so a file behaves like a live source.
        while pipeline.backlog() >= depth {
            thread::sleep(Duration::from_millis(1));
        }
        capture.push_interleaved(chunk)?;
        pb.inc(1);
    }
    while pipeline.backlog() > 0 {
        thread::sleep(Duration::from_millis(5));
    }
    // Let the worker finish the buffer it holds.
    thread::sleep(Duration::from_millis(50));
    pb.finish_and_clear();

    let report = pipeline.stop();
    governor.stop();
    drop(capture);
    drop(ctx);
    let _ = printer.join();

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => {
            println!(
                "  processed {} / dropped {} / flushed {}",
                report.processed, report.dropped, report.flushed
            );
            println!(
                "  latency mean {:.2}ms max {:.2}ms",
                report.mean_latency_ms, report.max_latency_ms
            );
            println!("  final mood {}", report.final_mood.mood);
        }
    }
    Ok(())
}
