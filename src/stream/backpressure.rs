//! Backpressure handling between signature discovery and event processing
//!
//! Ingestion must never wait on a slow consumer. The queue is bounded and
//! uses two watermarks: reaching the high mark switches it into backpressure
//! mode, where every offer is refused, and it only leaves that mode once
//! the consumer has drained it down to the low mark.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::BackpressureConfig;

/// Result of offering an event to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Dropped,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// Queue sizing
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub capacity: usize,
    pub high_water_mark: usize,
    pub low_water_mark: usize,
}

impl QueueLimits {
    /// Build limits, clamping so that low <= high <= capacity
    pub fn new(capacity: usize, high_water_mark: usize, low_water_mark: usize) -> Self {
        let capacity = capacity.max(1);
        let high_water_mark = high_water_mark.clamp(1, capacity);
        let low_water_mark = low_water_mark.min(high_water_mark);
        Self {
            capacity,
            high_water_mark,
            low_water_mark,
        }
    }
}

impl From<&BackpressureConfig> for QueueLimits {
    fn from(config: &BackpressureConfig) -> Self {
        Self::new(
            config.capacity,
            config.high_water_mark,
            config.low_water_mark,
        )
    }
}

/// Bounded, metered queue with hysteresis
pub struct BackpressureQueue<T> {
    limits: QueueLimits,
    buffer: Mutex<VecDeque<T>>,
    in_backpressure: AtomicBool,
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl<T> BackpressureQueue<T> {
    /// Create a new backpressure queue
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(limits.capacity.min(65_536))),
            limits,
            in_backpressure: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Offer an event without blocking
    pub fn offer(&self, event: T) -> Admission {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let depth = buffer.len();

        self.update_mode(depth);

        if self.in_backpressure.load(Ordering::SeqCst) || depth >= self.limits.capacity {
            drop(buffer);
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(depth, dropped, "Dropped event due to backpressure");
            return Admission::Dropped;
        }

        buffer.push_back(event);

        // Entering backpressure is decided on the depth we just produced
        self.update_mode(buffer.len());

        Admission::Accepted
    }

    /// Take the oldest event, counting it as processed
    pub fn pop(&self) -> Option<T> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let item = buffer.pop_front()?;
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.update_mode(buffer.len());
        Some(item)
    }

    /// Take up to `max` events in FIFO order
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let take = max.min(buffer.len());
        let batch: Vec<T> = buffer.drain(..take).collect();
        self.processed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.update_mode(buffer.len());
        batch
    }

    /// Apply watermark hysteresis for the given depth
    fn update_mode(&self, depth: usize) {
        let engaged = self.in_backpressure.load(Ordering::SeqCst);
        if !engaged && depth >= self.limits.high_water_mark {
            self.in_backpressure.store(true, Ordering::SeqCst);
            warn!(
                depth,
                high_water_mark = self.limits.high_water_mark,
                "Queue entered backpressure mode"
            );
        } else if engaged && depth <= self.limits.low_water_mark {
            self.in_backpressure.store(false, Ordering::SeqCst);
            info!(
                depth,
                low_water_mark = self.limits.low_water_mark,
                "Queue left backpressure mode"
            );
        }
    }

    /// Get current buffer size
    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Throttling signal for producers
    pub fn is_in_backpressure(&self) -> bool {
        self.in_backpressure.load(Ordering::SeqCst)
    }

    /// Events consumed so far
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Events refused so far
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    /// Get utilization percentage
    pub fn utilization(&self) -> f64 {
        (self.len() as f64 / self.limits.capacity as f64) * 100.0
    }
}
