//! # Device Window
//!
//! Per-gateway sliding buffer of the most recent cumulative readings plus the
//! bookkeeping the engine needs to decide when to emit: how many times the
//! buffer has been seen full since the last emission, the raw payload of the
//! last accepted message (for duplicate suppression), and a lifetime count of
//! accepted messages.

use std::collections::VecDeque;

use crate::configs::DeltaMode;

/// What the engine decided for one ingested message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmitDecision {
    /// Same raw payload as the previous accepted one. Nothing changed.
    Suppressed,
    /// The window is not full yet.
    Incomplete { held: usize },
    /// The window is full but has not been seen full often enough to emit.
    Accumulating { seen_full: u32 },
    /// A delta is ready to persist. The window now holds only its newest value.
    Ready { delta: f64, utc_timestamp: i64 },
    /// A negative delta was discarded by policy. The window was still reset.
    Rejected { delta: f64 },
}

/// Sliding window state of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceWindow {
    values: VecDeque<f64>,
    capacity: usize,
    seen_full: u32,
    last_payload: Option<Vec<u8>>,
    total_received: u64,
}

impl DeviceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
            seen_full: 0,
            last_payload: None,
            total_received: 0,
        }
    }

    pub fn is_duplicate(&self, raw: &[u8]) -> bool {
        self.last_payload.as_deref() == Some(raw)
    }

    /// Appends a value, evicting the oldest one when the window is full.
    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Counts an accepted message and remembers its payload.
    pub fn record(&mut self, raw: &[u8]) {
        self.total_received += 1;
        self.last_payload = Some(raw.to_vec());
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Held values, oldest first.
    pub fn values(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }

    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    pub fn seen_full(&self) -> u32 {
        self.seen_full
    }

    pub(crate) fn mark_full(&mut self) -> u32 {
        self.seen_full += 1;
        self.seen_full
    }

    /// Consumption across the held values, `None` with fewer than two.
    pub fn delta(&self, mode: DeltaMode) -> Option<f64> {
        if self.values.len() < 2 {
            return None;
        }
        match mode {
            DeltaMode::Boundary => {
                let first = self.values.front()?;
                let last = self.values.back()?;
                Some(last - first)
            }
            DeltaMode::WindowedSum => Some(
                self.values
                    .iter()
                    .zip(self.values.iter().skip(1))
                    .map(|(prev, next)| if next < prev { *next } else { next - prev })
                    .sum(),
            ),
        }
    }

    /// Collapses the window to its newest value after an emission.
    pub(crate) fn reset_to_latest(&mut self) {
        if let Some(latest) = self.values.back().copied() {
            self.values.clear();
            self.values.push_back(latest);
        }
        self.seen_full = 0;
    }
}
