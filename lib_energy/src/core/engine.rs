//! # Windowed Delta Engine
//!
//! Owns one [`DeviceWindow`] per gateway and decides, for every accepted
//! sample, whether a consumption delta is due.
//!
//! For each `ingest` call:
//!
//! 1. A payload identical to the device's previous one is `Suppressed` and
//!    touches nothing.
//! 2. The device's window is created on first use.
//! 3. The cumulative value enters the window (oldest evicted when full), the
//!    message is counted and its payload remembered.
//! 4. Until the window is full the answer is `Incomplete`.
//! 5. Once full, the window counts as "seen full"; when that count reaches the
//!    emit threshold the delta is computed, the negative-delta policy applied,
//!    and the window collapses to its newest value.
//!
//! The engine is synchronous and does no I/O. Identity resolution against the
//! store happens before `ingest` is called, so an unknown device never gets a
//! window.

use std::collections::HashMap;

use crate::configs::{NegativeDeltaPolicy, WindowPolicy};
use crate::core::payload::Sample;
use crate::core::window::{DeviceWindow, EmitDecision};

pub struct DeltaEngine {
    policy: WindowPolicy,
    /// Device name -> position in `windows`.
    index: HashMap<String, usize>,
    /// Windows in first-seen order.
    windows: Vec<(String, DeviceWindow)>,
}

impl DeltaEngine {
    pub fn new(policy: WindowPolicy) -> Self {
        Self {
            policy,
            index: HashMap::new(),
            windows: Vec::new(),
        }
    }

    pub fn policy(&self) -> &WindowPolicy {
        &self.policy
    }

    pub fn ingest(&mut self, device: &str, raw_payload: &[u8], sample: Sample) -> EmitDecision {
        if let Some(window) = self.window(device) {
            if window.is_duplicate(raw_payload) {
                return EmitDecision::Suppressed;
            }
        }

        let policy = self.policy;
        let window = self.window_mut_or_insert(device);
        window.push(sample.cumulative_kwh);
        window.record(raw_payload);

        if !window.is_full() {
            return EmitDecision::Incomplete { held: window.len() };
        }

        let seen_full = window.mark_full();
        if seen_full < policy.emit_threshold {
            return EmitDecision::Accumulating { seen_full };
        }

        // A window built with a capacity below two has no delta to give.
        let Some(delta) = window.delta(policy.delta_mode) else {
            return EmitDecision::Incomplete { held: window.len() };
        };
        window.reset_to_latest();

        if delta < 0.0 {
            match policy.negative_delta {
                NegativeDeltaPolicy::PassThrough => {}
                NegativeDeltaPolicy::Clamp => {
                    return EmitDecision::Ready {
                        delta: 0.0,
                        utc_timestamp: sample.utc_timestamp,
                    }
                }
                NegativeDeltaPolicy::Drop => return EmitDecision::Rejected { delta },
            }
        }

        EmitDecision::Ready {
            delta,
            utc_timestamp: sample.utc_timestamp,
        }
    }

    pub fn window(&self, device: &str) -> Option<&DeviceWindow> {
        self.index.get(device).map(|&i| &self.windows[i].1)
    }

    /// Device names in the order they were first seen.
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.windows.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn window_mut_or_insert(&mut self, device: &str) -> &mut DeviceWindow {
        let slot = match self.index.get(device) {
            Some(&i) => i,
            None => {
                let i = self.windows.len();
                self.windows
                    .push((device.to_string(), DeviceWindow::new(self.policy.capacity)));
                self.index.insert(device.to_string(), i);
                i
            }
        };
        &mut self.windows[slot].1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::DeltaMode;

    fn sample(ts: i64, kwh: f64) -> Sample {
        Sample {
            utc_timestamp: ts,
            cumulative_kwh: kwh,
        }
    }

    fn payload(ts: i64, kwh: f64) -> Vec<u8> {
        format!(r#"{{"utctimestamp":{},"v":{}}}"#, ts, kwh).into_bytes()
    }

    fn feed(engine: &mut DeltaEngine, device: &str, ts: i64, kwh: f64) -> EmitDecision {
        engine.ingest(device, &payload(ts, kwh), sample(ts, kwh))
    }

    fn policy(capacity: usize, threshold: u32, negative: NegativeDeltaPolicy) -> WindowPolicy {
        WindowPolicy::new(capacity, threshold, DeltaMode::Boundary, negative).unwrap()
    }

    #[test]
    fn test_emits_when_window_first_fills() {
        let mut engine = DeltaEngine::new(WindowPolicy::default());
        let values = [10.0, 10.5, 11.2, 12.0, 12.1, 12.9, 13.5];
        for (i, v) in values.iter().enumerate().take(6) {
            assert_eq!(
                feed(&mut engine, "gw-07", i as i64 * 60, *v),
                EmitDecision::Incomplete { held: i + 1 }
            );
        }
        match feed(&mut engine, "gw-07", 360, values[6]) {
            EmitDecision::Ready { delta, utc_timestamp } => {
                assert!((delta - 3.5).abs() < 1e-9);
                assert_eq!(utc_timestamp, 360);
            }
            other => panic!("expected Ready, got {:?}", other),
        }
        assert_eq!(engine.window("gw-07").unwrap().values(), vec![13.5]);
    }

    #[test]
    fn test_emits_again_after_capacity_minus_one_new_samples() {
        let mut engine = DeltaEngine::new(policy(3, 1, NegativeDeltaPolicy::PassThrough));
        let mut ready_at = Vec::new();
        for i in 0..9 {
            if let EmitDecision::Ready { .. } = feed(&mut engine, "a", i, i as f64) {
                ready_at.push(i);
            }
        }
        // Full at 3 samples, then every 2 new samples after the reset to one value.
        assert_eq!(ready_at, vec![2, 4, 6, 8]);
    }

    #[test]
    fn test_duplicate_payload_mutates_nothing() {
        let mut engine = DeltaEngine::new(WindowPolicy::default());
        feed(&mut engine, "a", 0, 1.0);
        let before = engine.window("a").unwrap().clone();

        assert_eq!(feed(&mut engine, "a", 0, 1.0), EmitDecision::Suppressed);
        assert_eq!(engine.window("a").unwrap(), &before);
        assert_eq!(engine.window("a").unwrap().total_received(), 1);
    }

    #[test]
    fn test_same_payload_on_other_device_is_not_duplicate() {
        let mut engine = DeltaEngine::new(WindowPolicy::default());
        feed(&mut engine, "a", 0, 1.0);
        assert_eq!(feed(&mut engine, "b", 0, 1.0), EmitDecision::Incomplete { held: 1 });
    }

    #[test]
    fn test_non_consecutive_repeat_is_accepted() {
        let mut engine = DeltaEngine::new(WindowPolicy::default());
        feed(&mut engine, "a", 0, 1.0);
        feed(&mut engine, "a", 60, 2.0);
        assert_eq!(feed(&mut engine, "a", 0, 1.0), EmitDecision::Incomplete { held: 3 });
    }

    #[test]
    fn test_emit_threshold_waits_for_repeated_fullness() {
        let mut engine = DeltaEngine::new(policy(3, 2, NegativeDeltaPolicy::PassThrough));
        assert_eq!(feed(&mut engine, "a", 0, 1.0), EmitDecision::Incomplete { held: 1 });
        assert_eq!(feed(&mut engine, "a", 1, 2.0), EmitDecision::Incomplete { held: 2 });
        assert_eq!(feed(&mut engine, "a", 2, 3.0), EmitDecision::Accumulating { seen_full: 1 });
        // Slides to [2, 3, 5] and emits.
        match feed(&mut engine, "a", 3, 5.0) {
            EmitDecision::Ready { delta, .. } => assert!((delta - 3.0).abs() < 1e-9),
            other => panic!("expected Ready, got {:?}", other),
        }
        assert_eq!(engine.window("a").unwrap().seen_full(), 0);
    }

    #[test]
    fn test_negative_delta_policies() {
        let drops = |negative| {
            let mut engine = DeltaEngine::new(policy(2, 1, negative));
            feed(&mut engine, "a", 0, 5.0);
            feed(&mut engine, "a", 1, 3.0)
        };
        assert_eq!(
            drops(NegativeDeltaPolicy::PassThrough),
            EmitDecision::Ready { delta: -2.0, utc_timestamp: 1 }
        );
        assert_eq!(
            drops(NegativeDeltaPolicy::Clamp),
            EmitDecision::Ready { delta: 0.0, utc_timestamp: 1 }
        );
        assert_eq!(drops(NegativeDeltaPolicy::Drop), EmitDecision::Rejected { delta: -2.0 });
    }

    #[test]
    fn test_rejected_delta_still_resets_window() {
        let mut engine = DeltaEngine::new(policy(2, 1, NegativeDeltaPolicy::Drop));
        feed(&mut engine, "a", 0, 5.0);
        feed(&mut engine, "a", 1, 3.0);
        assert_eq!(engine.window("a").unwrap().values(), vec![3.0]);
    }

    #[test]
    fn test_single_value_window_never_emits() {
        let single = WindowPolicy {
            capacity: 1,
            ..WindowPolicy::default()
        };
        let mut engine = DeltaEngine::new(single);
        for i in 0..4 {
            assert_eq!(feed(&mut engine, "a", i, i as f64), EmitDecision::Incomplete { held: 1 });
        }
        assert_eq!(engine.window("a").unwrap().values(), vec![3.0]);
    }

    #[test]
    fn test_devices_keep_first_seen_order() {
        let mut engine = DeltaEngine::new(WindowPolicy::default());
        for name in ["c", "a", "b", "a"] {
            feed(&mut engine, name, 0, 1.0);
        }
        assert_eq!(engine.devices().collect::<Vec<_>>(), vec!["c", "a", "b"]);
        assert_eq!(engine.len(), 3);
    }

    #[test]
    fn test_window_holds_most_recent_distinct_values() {
        let mut engine = DeltaEngine::new(policy(4, 3, NegativeDeltaPolicy::PassThrough));
        let inputs = [1.0, 1.0, 2.0, 3.0, 3.0, 4.0, 5.0];
        for (i, v) in inputs.iter().enumerate() {
            // Payload depends only on the value, so consecutive repeats are duplicates.
            engine.ingest("a", &payload(0, *v), sample(i as i64, *v));
            assert!(engine.window("a").unwrap().len() <= 4);
        }
        assert_eq!(engine.window("a").unwrap().values(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(engine.window("a").unwrap().total_received(), 5);
    }
}
