use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::analysis::features::AudioFeatures;
use crate::error::{AnalysisError, ErrorKind};
use crate::governor::PressureEvent;
use crate::mood::MoodSnapshot;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Features(Arc<AudioFeatures>),
    MoodChanged(MoodSnapshot),
    Pressure(PressureEvent),
    Error { kind: ErrorKind, message: String },
}

impl PipelineEvent {
    pub fn error(err: &AnalysisError) -> Self {
        PipelineEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Push-style fan-out of pipeline events to explicit subscribers.
///
/// Each subscriber gets its own unbounded channel so a slow consumer never
/// blocks the analysis worker; subscribers whose receiver was dropped are
/// pruned on the next publish.
#[derive(Default)]
pub struct Feed {
    subscribers: Mutex<Vec<Sender<PipelineEvent>>>,
}

impl Feed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Latest published value. Writers replace the whole `Arc`, so readers
/// only ever see complete values.
pub struct SnapshotCell<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> SnapshotCell<T> {
    pub fn empty() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn new(value: T) -> Self {
        Self {
            slot: Mutex::new(Some(Arc::new(value))),
        }
    }

    pub fn load(&self) -> Option<Arc<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn store(&self, value: Arc<T>) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
    }
}

impl<T> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::features::sample_features;
    use crate::mood::Mood;

    #[test]
    fn every_subscriber_sees_every_event_in_order() {
        let feed = Feed::new();
        let a = feed.subscribe();
        let b = feed.subscribe();
        let features = Arc::new(sample_features());
        feed.publish(PipelineEvent::Features(features.clone()));
        feed.publish(PipelineEvent::MoodChanged(MoodSnapshot {
            mood: Mood::Happy,
            confidence: 0.8,
            timestamp_ms: 1,
            sequence: 1,
        }));
        for rx in [a, b] {
            assert!(matches!(rx.try_recv(), Ok(PipelineEvent::Features(f)) if f == features));
            assert!(matches!(rx.try_recv(), Ok(PipelineEvent::MoodChanged(s)) if s.mood == Mood::Happy));
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let feed = Feed::new();
        let keep = feed.subscribe();
        drop(feed.subscribe());
        assert_eq!(feed.subscriber_count(), 2);
        let err = AnalysisError::InferenceFailed("x".into());
        assert_eq!(feed.publish(PipelineEvent::error(&err)), 1);
        assert_eq!(feed.subscriber_count(), 1);
        assert!(matches!(
            keep.try_recv(),
            Ok(PipelineEvent::Error { kind: ErrorKind::InferenceFailed, .. })
        ));
    }

    #[test]
    fn snapshot_cell_replaces_whole_value() {
        let cell = SnapshotCell::empty();
        assert!(cell.load().is_none());
        cell.store(Arc::new(1u32));
        let first = cell.load().unwrap();
        cell.store(Arc::new(2u32));
        assert_eq!(*first, 1);
        assert_eq!(*cell.load().unwrap(), 2);
    }
}
