use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}

#[derive(Parser, Debug)]
#[command(name = "moodscope", about = "Audio feature extraction and mood inference")]
pub struct Cli {
    /// Input audio file (WAV, MP3, FLAC, OGG, AAC)
    pub input: Option<PathBuf>,

    /// Analysis preset (quick, standard, comprehensive) or a stage list
    /// such as "spectral+tempo+mood"
    #[arg(short, long, default_value = "comprehensive")]
    pub preset: String,

    /// Give up after this many seconds, leaving a checkpoint behind
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Directory for analysis checkpoints
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Resume from a checkpoint left by an earlier run
    #[arg(long)]
    pub resume: bool,

    /// Feed the file through the real-time pipeline and print each mood change
    #[arg(long)]
    pub stream: bool,

    /// Frames per analysis buffer
    #[arg(long, default_value_t = 4096)]
    pub chunk_frames: usize,

    /// Softmax temperature of the mood model
    #[arg(long, default_value_t = 0.03)]
    pub temperature: f32,

    /// Mood model file (JSON prototypes); defaults to the built-in profiles
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Config file; defaults to moodscope.toml or the user config dir
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// List the mood labels and exit
    #[arg(long)]
    pub list_moods: bool,
}
