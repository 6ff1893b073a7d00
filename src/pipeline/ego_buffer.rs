// src/pipeline/ego_buffer.rs
//
// Ring buffer of per-frame camera motion, indexed by frame timestamp.
// When a late detection arrives we need the motion accumulated *since that
// detection was captured*, not just the latest frame's delta.

use crate::analysis::ego_motion::EgoMotionDelta;
use nalgebra::Isometry3;
use std::collections::VecDeque;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 600; // ~20s at 30fps

pub struct EgoMotionBuffer {
    entries: VecDeque<EgoEntry>,
    capacity: usize,
    horizon_ms: f64,
}

#[derive(Debug, Clone, Copy)]
struct EgoEntry {
    timestamp_ms: f64,
    delta: EgoMotionDelta,
}

impl EgoMotionBuffer {
    /// Keep deltas for at least `horizon_ms` (the late-result window).
    pub fn new(horizon_ms: f64) -> Self {
        Self::with_capacity(horizon_ms, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(horizon_ms: f64, capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity: capacity.max(1),
            horizon_ms,
        }
    }

    /// Record the motion that led into the frame at `timestamp_ms`.
    pub fn push(&mut self, timestamp_ms: f64, delta: EgoMotionDelta) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(EgoEntry {
            timestamp_ms,
            delta,
        });

        let cutoff = timestamp_ms - self.horizon_ms;
        while self
            .entries
            .front()
            .map(|e| e.timestamp_ms < cutoff)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
    }

    /// Composed camera motion over all frames captured after `since_ms`:
    /// the current camera pose expressed in the camera frame at `since_ms`.
    pub fn motion_since(&self, since_ms: f64) -> Isometry3<f64> {
        let mut motion = Isometry3::identity();
        let mut applied = 0;
        for entry in self.entries.iter().filter(|e| e.timestamp_ms > since_ms) {
            motion = motion * entry.delta.isometry();
            applied += 1;
        }
        debug!(
            "Ego-motion since {:.0}ms: {} deltas, |t|={:.3}m",
            since_ms,
            applied,
            motion.translation.vector.norm()
        );
        motion
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ego_motion::compensate_with;
    use nalgebra::Vector3;

    #[test]
    fn test_composes_only_newer_deltas() {
        let mut buffer = EgoMotionBuffer::new(5_000.0);
        buffer.push(1_000.0, EgoMotionDelta::translation(0.0, 0.0, 0.5));
        buffer.push(1_100.0, EgoMotionDelta::translation(0.0, 0.0, 0.5));
        buffer.push(1_200.0, EgoMotionDelta::translation(0.0, 0.0, 0.5));

        // Detection captured at 1000ms: two forward steps happened since
        let motion = buffer.motion_since(1_000.0);
        let p = compensate_with(&motion, &Vector3::new(0.0, 0.0, 6.0));
        assert!((p.z - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_nothing_newer_is_identity() {
        let mut buffer = EgoMotionBuffer::new(5_000.0);
        buffer.push(1_000.0, EgoMotionDelta::translation(1.0, 0.0, 0.0));
        let motion = buffer.motion_since(1_000.0);
        assert!(motion.translation.vector.norm() < 1e-12);
    }

    #[test]
    fn test_old_entries_pruned_past_horizon() {
        let mut buffer = EgoMotionBuffer::new(1_000.0);
        for i in 0..20 {
            buffer.push(i as f64 * 100.0, EgoMotionDelta::identity());
        }
        // Entries from 900ms..=1900ms survive
        assert_eq!(buffer.len(), 11);
    }

    #[test]
    fn test_capacity_bound() {
        let mut buffer = EgoMotionBuffer::with_capacity(1e9, 4);
        for i in 0..10 {
            buffer.push(i as f64, EgoMotionDelta::identity());
        }
        assert_eq!(buffer.len(), 4);
    }
}
