use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::buffer::{AudioBuffer, BufferFormat};
use crate::config::PoolConfig;
use crate::error::{AnalysisError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub outstanding: usize,
    pub tracked_bytes: usize,
    pub peak_tracked_bytes: usize,
    pub allocations: u64,
    pub reuses: u64,
    pub evictions: u64,
    pub discarded: u64,
    pub leaked: u64,
}

struct Checkout {
    bytes: usize,
    since: Instant,
    order: u64,
}

struct PoolState {
    idle: Vec<AudioBuffer>,
    outstanding: HashMap<u64, Checkout>,
    idle_limit: usize,
    next_id: u64,
    checkouts: u64,
    stats: PoolStats,
}

impl PoolState {
    fn check_out(&mut self, id: u64, bytes: usize) {
        self.checkouts += 1;
        let order = self.checkouts;
        self.outstanding.insert(id, Checkout { bytes, since: Instant::now(), order });
    }

    fn idle_bytes(&self) -> usize {
        self.idle.iter().map(AudioBuffer::bytes).sum()
    }

    fn charge(&mut self, bytes: usize) {
        self.stats.tracked_bytes += bytes;
        self.stats.peak_tracked_bytes = self.stats.peak_tracked_bytes.max(self.stats.tracked_bytes);
    }

    fn refund(&mut self, bytes: usize) {
        self.stats.tracked_bytes = self.stats.tracked_bytes.saturating_sub(bytes);
    }

    /// Forgets the least recently checked-out buffer. Its holder keeps the
    /// memory, but the pool no longer counts it and will discard it on
    /// release.
    fn evict_oldest_checkout(&mut self) -> bool {
        let oldest = self
            .outstanding
            .iter()
            .min_by_key(|(_, c)| c.order)
            .map(|(&id, _)| id);
        match oldest.and_then(|id| self.outstanding.remove(&id)) {
            Some(checkout) => {
                self.refund(checkout.bytes);
                self.stats.evictions += 1;
                true
            }
            None => false,
        }
    }

    fn drain_idle(&mut self, keep: usize) -> usize {
        let mut freed = 0;
        while self.idle.len() > keep {
            if let Some(buf) = self.idle.pop() {
                freed += buf.bytes();
                self.refund(buf.bytes());
            }
        }
        freed
    }
}

/// What a fresh allocation cost, reported once the lock is released.
struct Growth {
    cleared: usize,
    tracked: usize,
}

/// Bounded set of reusable sample buffers shared by the capture and the
/// analysis contexts.
///
/// All bookkeeping sits behind one mutex held only for list manipulation.
/// Sample copies happen outside it; the lock covers an allocation only when
/// the pool has to grow.
pub struct BufferPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Self {
        let idle_limit = config.max_idle_buffers;
        Self {
            config,
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(idle_limit),
                outstanding: HashMap::with_capacity(idle_limit * 2),
                idle_limit,
                next_id: 1,
                checkouts: 0,
                stats: PoolStats::default(),
            }),
        }
    }

    /// Pre-allocates `count` idle buffers so the capture path starts warm.
    pub fn prewarm(&self, format: BufferFormat, frames: usize, count: usize) -> Result<usize> {
        let mut made = Vec::with_capacity(count);
        for _ in 0..count {
            made.push(self.acquire(format, frames)?);
        }
        let n = made.len();
        for buf in made {
            self.release(buf);
        }
        Ok(n)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn ceiling(&self) -> usize {
        self.config.memory_ceiling_bytes
    }

    /// Checks out a buffer holding at least `frames` frames of `format`.
    ///
    /// Idle buffers with the same channel count and layout are reused,
    /// smallest fitting first. Otherwise a new buffer is allocated; if that
    /// would break the memory ceiling, the oldest checkouts are evicted,
    /// then the idle list is cleared. If it still does not fit the call
    /// fails with `DeviceResourcesUnavailable`.
    pub fn acquire(&self, format: BufferFormat, frames: usize) -> Result<AudioBuffer> {
        let (buf, growth) = self.checkout(format, frames)?;
        if let Some(growth) = growth {
            if growth.cleared > 0 {
                log::debug!("Pool over ceiling, cleared {} idle bytes", growth.cleared);
            }
            log::debug!(
                "Pool allocated buffer #{} ({} frames x {} ch, tracked {} bytes)",
                buf.id(),
                frames,
                format.channels,
                growth.tracked
            );
        }
        Ok(buf)
    }

    /// [`acquire`](Self::acquire) without logging, for the capture path.
    /// Growth still shows up in [`stats`](Self::stats).
    pub fn acquire_quiet(&self, format: BufferFormat, frames: usize) -> Result<AudioBuffer> {
        self.checkout(format, frames).map(|(buf, _)| buf)
    }

    fn checkout(&self, format: BufferFormat, frames: usize) -> Result<(AudioBuffer, Option<Growth>)> {
        format.validate()?;
        if frames == 0 {
            return Err(AnalysisError::InvalidAudioFormat("zero-frame buffer requested".into()));
        }
        let mut state = self.lock();

        let reusable = state
            .idle
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                let f = b.format();
                f.channels == format.channels && f.layout == format.layout && b.capacity() >= frames
            })
            .min_by_key(|(_, b)| b.capacity())
            .map(|(i, _)| i);

        if let Some(index) = reusable {
            let mut buf = state.idle.swap_remove(index);
            buf.reset(format);
            state.check_out(buf.id(), buf.bytes());
            state.stats.reuses += 1;
            return Ok((buf, None));
        }

        let bytes = AudioBuffer::bytes_for(&format, frames);
        let ceiling = self.config.memory_ceiling_bytes;
        if bytes > ceiling {
            return Err(AnalysisError::DeviceResourcesUnavailable(format!(
                "buffer of {} bytes exceeds pool ceiling of {} bytes",
                bytes, ceiling
            )));
        }
        while state.stats.tracked_bytes + bytes > ceiling && state.evict_oldest_checkout() {}
        let mut cleared = 0;
        if state.stats.tracked_bytes + bytes > ceiling {
            cleared = state.drain_idle(0);
        }
        if state.stats.tracked_bytes + bytes > ceiling {
            return Err(AnalysisError::DeviceResourcesUnavailable(format!(
                "pool ceiling of {} bytes reached",
                ceiling
            )));
        }

        let id = state.next_id;
        state.next_id += 1;
        let buf = AudioBuffer::allocate(id, format, frames)?;
        state.charge(bytes);
        state.check_out(id, bytes);
        state.stats.allocations += 1;
        let growth = Growth {
            cleared,
            tracked: state.stats.tracked_bytes,
        };
        Ok((buf, Some(growth)))
    }

    /// Returns a checked-out buffer. It is kept for reuse while the idle
    /// list is below its cap, otherwise discarded. Buffers the pool no
    /// longer tracks (evicted or collected as leaked) are always discarded.
    pub fn release(&self, mut buf: AudioBuffer) {
        let mut state = self.lock();
        let Some(checkout) = state.outstanding.remove(&buf.id()) else {
            state.stats.discarded += 1;
            return;
        };
        if state.idle.len() < state.idle_limit {
            buf.clear();
            state.idle.push(buf);
        } else {
            state.refund(checkout.bytes);
            state.stats.discarded += 1;
        }
    }

    /// Halves the idle reserve and lowers the idle cap until
    /// [`restore_size`](Self::restore_size).
    pub fn reduce_size(&self) -> usize {
        let mut state = self.lock();
        let keep = state.idle.len() / 2;
        let cap = (state.idle_limit / 2).max(1);
        state.idle_limit = cap;
        let freed = state.drain_idle(keep.min(cap));
        drop(state);
        log::debug!("Pool reduced: freed {} bytes, idle cap {}", freed, cap);
        freed
    }

    pub fn restore_size(&self) {
        let mut state = self.lock();
        state.idle_limit = self.config.max_idle_buffers;
    }

    /// Drops every idle buffer. Outstanding checkouts stay tracked.
    pub fn release_all(&self) -> usize {
        let mut state = self.lock();
        let freed = state.drain_idle(0);
        drop(state);
        log::debug!("Pool released all idle buffers ({} bytes)", freed);
        freed
    }

    /// Stops tracking checkouts older than `max_age`; those are buffers
    /// dropped by their holder without being released.
    pub fn collect_leaked(&self, max_age: Duration) -> usize {
        let mut state = self.lock();
        let now = Instant::now();
        let stale: Vec<u64> = state
            .outstanding
            .iter()
            .filter(|(_, c)| now.duration_since(c.since) >= max_age)
            .map(|(&id, _)| id)
            .collect();
        let mut freed = 0;
        for id in stale {
            if let Some(checkout) = state.outstanding.remove(&id) {
                freed += checkout.bytes;
                state.refund(checkout.bytes);
                state.stats.leaked += 1;
            }
        }
        drop(state);
        if freed > 0 {
            log::warn!("Pool collected {} leaked bytes", freed);
        }
        freed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            idle: state.idle.len(),
            outstanding: state.outstanding.len(),
            ..state.stats
        }
    }

    /// Current cap on idle buffers; lowered by [`reduce_size`](Self::reduce_size).
    pub fn idle_limit(&self) -> usize {
        self.lock().idle_limit
    }

    pub fn tracked_bytes(&self) -> usize {
        self.lock().stats.tracked_bytes
    }

    pub fn idle_bytes(&self) -> usize {
        self.lock().idle_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool(max_idle: usize, ceiling: usize) -> BufferPool {
        BufferPool::new(PoolConfig {
            max_idle_buffers: max_idle,
            memory_ceiling_bytes: ceiling,
            default_frames: 1024,
        })
    }

    #[test]
    fn released_buffers_are_reused() {
        let pool = pool(4, 1 << 20);
        let fmt = BufferFormat::mono(44_100);
        let a = pool.acquire(fmt, 1024).unwrap();
        let id = a.id();
        pool.release(a);
        let b = pool.acquire(fmt, 512).unwrap();
        assert_eq!(b.id(), id);
        assert!(b.capacity() >= 512);
        let stats = pool.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.reuses, 1);
    }

    #[test]
    fn quiet_checkouts_share_the_same_bookkeeping() {
        let pool = pool(4, 64 * 1024);
        let fmt = BufferFormat::mono(44_100);
        let a = pool.acquire_quiet(fmt, 1024).unwrap();
        let b = pool.acquire(fmt, 1024).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.stats().allocations, 2);
        assert_eq!(pool.stats().outstanding, 2);
        pool.release(a);
        let c = pool.acquire_quiet(fmt, 1024).unwrap();
        assert_eq!(pool.stats().reuses, 1);
        assert!(matches!(
            pool.acquire_quiet(fmt, 1 << 20),
            Err(AnalysisError::DeviceResourcesUnavailable(_))
        ));
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn smaller_idle_buffer_is_not_reused_for_larger_request() {
        let pool = pool(4, 1 << 20);
        let fmt = BufferFormat::mono(44_100);
        let small = pool.acquire(fmt, 256).unwrap();
        pool.release(small);
        let big = pool.acquire(fmt, 1024).unwrap();
        assert!(big.capacity() >= 1024);
        assert_eq!(pool.stats().allocations, 2);
    }

    #[test]
    fn release_beyond_idle_cap_discards() {
        let pool = pool(1, 1 << 20);
        let fmt = BufferFormat::mono(44_100);
        let a = pool.acquire(fmt, 1024).unwrap();
        let b = pool.acquire(fmt, 1024).unwrap();
        pool.release(a);
        pool.release(b);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.tracked_bytes, 1024 * 4);
    }

    #[test]
    fn ceiling_evicts_oldest_checkout_first() {
        let pool = pool(4, 3 * 4096);
        let fmt = BufferFormat::mono(44_100);
        let first = pool.acquire(fmt, 1024).unwrap();
        let _second = pool.acquire(fmt, 1024).unwrap();
        let _third = pool.acquire(fmt, 1024).unwrap();
        let _fourth = pool.acquire(fmt, 1024).unwrap();
        let stats = pool.stats();
        assert!(stats.tracked_bytes <= pool.ceiling());
        assert_eq!(stats.evictions, 1);

        // The evicted buffer is discarded on release instead of pooled.
        pool.release(first);
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn request_larger_than_ceiling_is_resource_error() {
        let pool = pool(4, 1024);
        let err = pool.acquire(BufferFormat::mono(44_100), 1024).unwrap_err();
        assert!(matches!(err, AnalysisError::DeviceResourcesUnavailable(_)));
    }

    #[test]
    fn reduce_and_release_all_shrink_idle_reserve() {
        let pool = pool(8, 1 << 20);
        let fmt = BufferFormat::mono(44_100);
        pool.prewarm(fmt, 1024, 8).unwrap();
        assert_eq!(pool.stats().idle, 8);
        pool.reduce_size();
        assert_eq!(pool.stats().idle, 4);
        assert_eq!(pool.idle_limit(), 4);
        assert!(pool.reduce_size() > 0);
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(pool.idle_limit(), 2);
        pool.release_all();
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.tracked_bytes(), 0);
        pool.restore_size();
        pool.prewarm(fmt, 1024, 8).unwrap();
        assert_eq!(pool.stats().idle, 8);
    }

    #[test]
    fn dropped_checkouts_stay_charged_until_collected() {
        let pool = pool(4, 1 << 20);
        let buf = pool.acquire(BufferFormat::mono(44_100), 1024).unwrap();
        drop(buf);
        assert_eq!(pool.tracked_bytes(), 4096);
        assert_eq!(pool.collect_leaked(Duration::ZERO), 4096);
        assert_eq!(pool.tracked_bytes(), 0);
        assert_eq!(pool.stats().leaked, 1);
    }

    #[test]
    fn concurrent_pressure_respects_ceiling() {
        let ceiling = 16 * 4096;
        let pool = Arc::new(pool(4, ceiling));
        let fmt = BufferFormat::mono(44_100);
        let mut handles = Vec::new();
        for t in 0..4 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    if let Ok(buf) = pool.acquire(fmt, 512 + (i % 3) * 256) {
                        assert!(pool.tracked_bytes() <= ceiling);
                        pool.release(buf);
                    }
                    if t == 0 && i % 50 == 0 {
                        pool.reduce_size();
                        pool.release_all();
                        pool.restore_size();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let stats = pool.stats();
        assert!(stats.peak_tracked_bytes <= ceiling);
        assert_eq!(stats.outstanding, 0);
    }
}
