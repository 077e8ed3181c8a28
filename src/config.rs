use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::retry::RetryPolicy;

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_idle_buffers")]
    pub max_idle_buffers: usize,
    #[serde(default = "default_pool_ceiling")]
    pub memory_ceiling_bytes: usize,
    /// Frames per capture buffer when the caller does not ask for a size.
    #[serde(default = "default_frames")]
    pub default_frames: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Preset name or `+`-separated stage list.
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_rolloff")]
    pub rolloff_percent: f32,
    #[serde(default = "default_max_fft_size")]
    pub max_fft_size: usize,
    /// Capacity of the capture → analysis queue, in buffers.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Frames per chunk when a decoded file is split into buffers.
    #[serde(default = "default_frames")]
    pub chunk_frames: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Minimum raw confidence to switch to a different mood.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Minimum smoothed confidence to switch to a different mood.
    #[serde(default = "default_stability_factor")]
    pub stability_factor: f32,
    /// Minimum raw confidence to reaffirm the current mood.
    #[serde(default = "default_same_mood_threshold")]
    pub same_mood_threshold: f32,
    /// Weight of the most recent sample in the exponential smoothing.
    #[serde(default = "default_smoothing_alpha")]
    pub smoothing_alpha: f32,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    #[serde(default = "default_snapshot_history")]
    pub snapshot_history: usize,
    /// Softmax temperature of the default prototype model.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GovernorConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Process memory considered 100% usage.
    #[serde(default = "default_governor_ceiling")]
    pub memory_ceiling_bytes: u64,
    #[serde(default = "default_elevated_ratio")]
    pub elevated_ratio: f32,
    #[serde(default = "default_critical_ratio")]
    pub critical_ratio: f32,
    /// Per-buffer processing time considered 100% usage.
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,
    /// Consecutive calm samples required before stepping down a level.
    #[serde(default = "default_recovery_debounce")]
    pub recovery_debounce: u32,
    /// Checkouts older than this are treated as leaked on critical pressure.
    #[serde(default = "default_leak_age_ms")]
    pub leak_age_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_interval")]
    pub interval_secs: u64,
    /// Directory for file-backed checkpoints; defaults to the platform data dir.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_buffers: default_max_idle_buffers(),
            memory_ceiling_bytes: default_pool_ceiling(),
            default_frames: default_frames(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            preset: default_preset(),
            rolloff_percent: default_rolloff(),
            max_fft_size: default_max_fft_size(),
            queue_depth: default_queue_depth(),
            cache_capacity: default_cache_capacity(),
            chunk_frames: default_frames(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            stability_factor: default_stability_factor(),
            same_mood_threshold: default_same_mood_threshold(),
            smoothing_alpha: default_smoothing_alpha(),
            history_len: default_history_len(),
            snapshot_history: default_snapshot_history(),
            temperature: default_temperature(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            memory_ceiling_bytes: default_governor_ceiling(),
            elevated_ratio: default_elevated_ratio(),
            critical_ratio: default_critical_ratio(),
            latency_budget_ms: default_latency_budget_ms(),
            recovery_debounce: default_recovery_debounce(),
            leak_age_ms: default_leak_age_ms(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_checkpoint_interval(),
            directory: None,
        }
    }
}

fn default_max_idle_buffers() -> usize { 16 }
fn default_pool_ceiling() -> usize { 32 * 1024 * 1024 }
fn default_frames() -> usize { 4096 }
fn default_preset() -> String { "comprehensive".into() }
fn default_rolloff() -> f32 { 0.85 }
fn default_max_fft_size() -> usize { 16384 }
fn default_queue_depth() -> usize { 8 }
fn default_cache_capacity() -> usize { 32 }
fn default_confidence_threshold() -> f32 { 0.6 }
fn default_stability_factor() -> f32 { 0.55 }
fn default_same_mood_threshold() -> f32 { 0.4 }
fn default_smoothing_alpha() -> f32 { 0.5 }
fn default_history_len() -> usize { 8 }
fn default_snapshot_history() -> usize { 50 }
fn default_temperature() -> f32 { 0.03 }
fn default_sample_interval_ms() -> u64 { 500 }
fn default_governor_ceiling() -> u64 { 512 * 1024 * 1024 }
fn default_elevated_ratio() -> f32 { 0.7 }
fn default_critical_ratio() -> f32 { 0.9 }
fn default_latency_budget_ms() -> u64 { 100 }
fn default_recovery_debounce() -> u32 { 3 }
fn default_leak_age_ms() -> u64 { 5000 }
fn default_checkpoint_interval() -> u64 { 30 }

pub fn load_config(path: &Path) -> Option<Config> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            log::warn!("Ignoring malformed config {}: {}", path.display(), e);
            None
        }
    }
}

/// `moodscope.toml` in the working directory, then the XDG-style
/// `~/.config/moodscope/config.toml`, then the platform config dir.
pub fn find_config() -> Option<PathBuf> {
    let local = PathBuf::from("moodscope.toml");
    if local.exists() {
        return Some(local);
    }
    if let Some(home) = dirs::home_dir() {
        let xdg = home.join(".config").join("moodscope").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        let platform = config_dir.join("moodscope").join("config.toml");
        if platform.exists() {
            return Some(platform);
        }
    }
    None
}
