use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::analysis::features::AudioFeatures;
use crate::options::AnalysisOptions;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable identifier of an audio source: a 64-bit FNV-1a hash of either
/// the sample content or an explicit name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub u64);

impl SourceId {
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        let mut h = fnv(FNV_OFFSET, &sample_rate.to_le_bytes());
        for s in samples {
            h = fnv(h, &s.to_bits().to_le_bytes());
        }
        SourceId(h)
    }

    pub fn from_name(name: &str) -> Self {
        SourceId(fnv(FNV_OFFSET, name.as_bytes()))
    }

    /// Fixed-width hex, safe as a file name.
    pub fn key(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn fnv(mut h: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Recent analysis results, least recently used evicted first. Entries are
/// keyed by source and stage set, so a quick pass never answers for a
/// comprehensive one.
pub struct ResultCache {
    entries: Option<Mutex<LruCache<(SourceId, AnalysisOptions), Arc<AudioFeatures>>>>,
}

impl ResultCache {
    /// A capacity of 0 disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|c| Mutex::new(LruCache::new(c))),
        }
    }

    pub fn get(&self, id: SourceId, options: AnalysisOptions) -> Option<Arc<AudioFeatures>> {
        let entries = self.entries.as_ref()?;
        let mut cache = entries.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(&(id, options)).cloned()
    }

    pub fn insert(&self, id: SourceId, options: AnalysisOptions, features: Arc<AudioFeatures>) {
        if let Some(entries) = &self.entries {
            let mut cache = entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((evicted, _)) = cache.push((id, options), features) {
                if evicted.0 != id || evicted.1 != options {
                    log::debug!("Result cache evicted {}", evicted.0);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .as_ref()
            .map(|e| e.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::features::sample_features;

    #[test]
    fn ids_are_stable_and_content_sensitive() {
        let a = SourceId::from_samples(&[0.1, 0.2, 0.3], 44_100);
        assert_eq!(a, SourceId::from_samples(&[0.1, 0.2, 0.3], 44_100));
        assert_ne!(a, SourceId::from_samples(&[0.1, 0.2, 0.31], 44_100));
        assert_ne!(a, SourceId::from_samples(&[0.1, 0.2, 0.3], 48_000));
        // Reference FNV-1a value for the empty input.
        assert_eq!(SourceId::from_name("").0, FNV_OFFSET);
        assert_eq!(SourceId::from_name("a").0, 0xaf63_dc4c_8601_ec8c);
        assert_eq!(a.key().len(), 16);
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = ResultCache::new(2);
        let f = Arc::new(sample_features());
        let (a, b, c) = (SourceId(1), SourceId(2), SourceId(3));
        let opts = AnalysisOptions::STANDARD;
        cache.insert(a, opts, f.clone());
        cache.insert(b, opts, f.clone());
        assert!(cache.get(a, opts).is_some());
        cache.insert(c, opts, f.clone());
        assert!(cache.get(b, opts).is_none());
        assert!(cache.get(a, opts).is_some());
        assert!(cache.get(c, opts).is_some());
        assert!(cache.get(a, AnalysisOptions::QUICK).is_none());
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = ResultCache::new(0);
        cache.insert(SourceId(1), AnalysisOptions::QUICK, Arc::new(sample_features()));
        assert!(cache.is_empty());
        assert!(cache.get(SourceId(1), AnalysisOptions::QUICK).is_none());
    }
}
