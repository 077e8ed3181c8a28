pub mod aggregate;
pub mod features;
pub mod key;
pub mod loudness;
pub mod spectral;
pub mod tempo;
pub mod time_domain;

pub use aggregate::FeatureAggregator;
pub use features::{AudioFeatures, Mode, SpectralFeatures};
pub use spectral::SpectralAnalyzer;
pub use time_domain::TimeDomainStats;
