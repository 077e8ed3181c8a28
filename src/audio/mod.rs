pub mod buffer;
pub mod decode;
pub mod pool;

pub use buffer::{AudioBuffer, BufferFormat, Layout, SampleFormat};
pub use decode::{decode_file, DecodedAudio};
pub use pool::{BufferPool, PoolStats};
