//! Streaming statistical anomaly detection over [`Sample`] ratios.
//!
//! Two-phase lifecycle: a [`Learning`] accumulator ingests samples and finalizes into a
//! [`Baseline`]; a [`Ready`] engine then scores incoming samples against it. The phase
//! transition is modeled as a type change (`Learning::finalize` consumes `self`) rather
//! than a runtime flag, so "detect before ready" cannot compile.

use std::collections::VecDeque;

use crate::sample::Sample;

macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($ty);

        impl $name {
            pub const NONE: $name = $name(0);
            $(pub const $variant: $name = $name($value);)*

            pub fn contains(&self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub fn bits(&self) -> $ty {
                self.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like! {
    /// Bitmask of anomaly conditions raised by one detection.
    pub struct AnomalyFlags: u32 {
        const CACHE_MISS_SPIKE = 1 << 0;
        const BRANCH_MISS_SPIKE = 1 << 1;
        const IPC_COLLAPSE = 1 << 2;
        const BURST_PATTERN = 1 << 3;
        const OSCILLATION = 1 << 4;
    }
}

impl std::fmt::Display for AnomalyFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut parts = Vec::new();
        if self.contains(AnomalyFlags::CACHE_MISS_SPIKE) {
            parts.push("cache_miss_spike");
        }
        if self.contains(AnomalyFlags::BRANCH_MISS_SPIKE) {
            parts.push("branch_miss_spike");
        }
        if self.contains(AnomalyFlags::IPC_COLLAPSE) {
            parts.push("ipc_collapse");
        }
        if self.contains(AnomalyFlags::BURST_PATTERN) {
            parts.push("burst_pattern");
        }
        if self.contains(AnomalyFlags::OSCILLATION) {
            parts.push("oscillation");
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Finalized statistical reference model for one metric triple.
#[derive(Debug, Clone, Copy, Default)]
pub struct Baseline {
    pub mean_cache_miss_rate: f64,
    pub std_cache_miss_rate: f64,
    pub mean_branch_miss_rate: f64,
    pub std_branch_miss_rate: f64,
    pub mean_ipc: f64,
    pub std_ipc: f64,
    pub sample_count: u64,
}

/// Per-sample detection output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionResult {
    pub z_cache_miss: f64,
    pub z_branch_miss: f64,
    pub z_ipc: f64,
    pub composite_score: f64,
    pub flags: AnomalyFlags,
    pub sustained_count: u32,
}

impl DetectionResult {
    pub fn is_anomalous(&self) -> bool {
        !self.flags.is_empty()
    }
}

struct Accumulator {
    sum_cmr: f64,
    sum_cmr2: f64,
    sum_bmr: f64,
    sum_bmr2: f64,
    sum_ipc: f64,
    sum_ipc2: f64,
    n: u64,
}

impl Accumulator {
    fn new() -> Self {
        Accumulator {
            sum_cmr: 0.0,
            sum_cmr2: 0.0,
            sum_bmr: 0.0,
            sum_bmr2: 0.0,
            sum_ipc: 0.0,
            sum_ipc2: 0.0,
            n: 0,
        }
    }

    fn observe(&mut self, s: &Sample) {
        let cmr = s.cache_miss_rate as f64;
        let bmr = s.branch_miss_rate as f64;
        let ipc = s.ipc as f64;

        self.sum_cmr += cmr;
        self.sum_cmr2 += cmr * cmr;
        self.sum_bmr += bmr;
        self.sum_bmr2 += bmr * bmr;
        self.sum_ipc += ipc;
        self.sum_ipc2 += ipc * ipc;
        self.n += 1;
    }
}

/// Engine in the learning phase: accumulates statistics, cannot yet detect.
pub struct Learning {
    acc: Accumulator,
    z_threshold: f64,
    burst_window: u32,
}

impl Learning {
    pub fn new(z_threshold: f64, burst_window: u32) -> Learning {
        Learning {
            acc: Accumulator::new(),
            z_threshold,
            burst_window,
        }
    }

    pub fn observe(&mut self, sample: &Sample) {
        self.acc.observe(sample);
    }

    pub fn sample_count(&self) -> u64 {
        self.acc.n
    }

    /// Computes mean/stddev for each ratio and transitions into the detection phase.
    /// Negative variance from floating-point rounding is clamped to zero before the
    /// square root. Consuming `self` makes the one-way transition a compile-time fact.
    pub fn finalize(self) -> Ready {
        let n = self.acc.n.max(1) as f64;

        let mean_cmr = self.acc.sum_cmr / n;
        let mean_bmr = self.acc.sum_bmr / n;
        let mean_ipc = self.acc.sum_ipc / n;

        let (mut var_cmr, mut var_bmr, mut var_ipc) = (0.0, 0.0, 0.0);
        if self.acc.n >= 2 {
            var_cmr = self.acc.sum_cmr2 / n - mean_cmr * mean_cmr;
            var_bmr = self.acc.sum_bmr2 / n - mean_bmr * mean_bmr;
            var_ipc = self.acc.sum_ipc2 / n - mean_ipc * mean_ipc;
            if var_cmr < 0.0 {
                var_cmr = 0.0;
            }
            if var_bmr < 0.0 {
                var_bmr = 0.0;
            }
            if var_ipc < 0.0 {
                var_ipc = 0.0;
            }
        }

        let baseline = Baseline {
            mean_cache_miss_rate: mean_cmr,
            std_cache_miss_rate: var_cmr.sqrt(),
            mean_branch_miss_rate: mean_bmr,
            std_branch_miss_rate: var_bmr.sqrt(),
            mean_ipc,
            std_ipc: var_ipc.sqrt(),
            sample_count: self.acc.n,
        };

        tracing::info!(
            samples = baseline.sample_count,
            cmr_mean = baseline.mean_cache_miss_rate,
            cmr_std = baseline.std_cache_miss_rate,
            bmr_mean = baseline.mean_branch_miss_rate,
            bmr_std = baseline.std_branch_miss_rate,
            ipc_mean = baseline.mean_ipc,
            ipc_std = baseline.std_ipc,
            "baseline computed"
        );

        Ready {
            baseline,
            z_threshold: self.z_threshold,
            burst_window: self.burst_window,
            consecutive_anomalies: 0,
            recent_cmr: VecDeque::from(vec![0.0f32; self.burst_window.max(1) as usize]),
            recent_idx: 0,
        }
    }
}

/// Engine in the detection phase: baseline is fixed, each sample is scored against it.
pub struct Ready {
    baseline: Baseline,
    z_threshold: f64,
    burst_window: u32,
    consecutive_anomalies: u32,
    recent_cmr: VecDeque<f32>,
    recent_idx: usize,
}

fn compute_z(value: f64, mean: f64, std: f64) -> f64 {
    if std < 1e-12 {
        return 0.0;
    }
    (value - mean) / std
}

/// Direction-change oscillation detector over a fixed-size circular buffer of recent
/// cache-miss rates. Needs at least 4 samples to be meaningful; flags when at least half
/// of the transitions reverse direction.
fn detect_oscillation(buf: &VecDeque<f32>, idx: usize) -> bool {
    let cap = buf.len();
    if cap < 4 {
        return false;
    }

    let mut direction_changes = 0i32;
    let mut prev_dir = 0i32;

    for i in 1..cap {
        let a = (idx + cap - i) % cap;
        let b = (idx + cap - i - 1) % cap;
        let diff = buf[a] - buf[b];
        let dir = if diff > 0.0 {
            1
        } else if diff < 0.0 {
            -1
        } else {
            0
        };
        if dir != 0 && dir != prev_dir && prev_dir != 0 {
            direction_changes += 1;
        }
        if dir != 0 {
            prev_dir = dir;
        }
    }

    direction_changes >= (cap / 2) as i32
}

impl Ready {
    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    /// Scores `sample` against the baseline, updating burst and oscillation state.
    pub fn detect(&mut self, sample: &Sample) -> DetectionResult {
        let cmr = sample.cache_miss_rate as f64;
        let bmr = sample.branch_miss_rate as f64;
        let ipc = sample.ipc as f64;

        let z_cache_miss = compute_z(
            cmr,
            self.baseline.mean_cache_miss_rate,
            self.baseline.std_cache_miss_rate,
        );
        let z_branch_miss = compute_z(
            bmr,
            self.baseline.mean_branch_miss_rate,
            self.baseline.std_branch_miss_rate,
        );
        let z_ipc = compute_z(ipc, self.baseline.mean_ipc, self.baseline.std_ipc);

        let mut flags = AnomalyFlags::NONE;
        let mut anomalous = false;

        if z_cache_miss > self.z_threshold {
            flags.insert(AnomalyFlags::CACHE_MISS_SPIKE);
            anomalous = true;
        }
        if z_branch_miss > self.z_threshold {
            flags.insert(AnomalyFlags::BRANCH_MISS_SPIKE);
            anomalous = true;
        }
        if z_ipc < -self.z_threshold {
            flags.insert(AnomalyFlags::IPC_COLLAPSE);
            anomalous = true;
        }

        self.recent_cmr[self.recent_idx] = cmr as f32;
        self.recent_idx = (self.recent_idx + 1) % self.burst_window.max(1) as usize;

        let sustained_count;
        if anomalous {
            self.consecutive_anomalies += 1;
            if self.consecutive_anomalies >= self.burst_window {
                flags.insert(AnomalyFlags::BURST_PATTERN);
            }
        } else {
            self.consecutive_anomalies = 0;
        }
        sustained_count = self.consecutive_anomalies;

        if detect_oscillation(&self.recent_cmr, self.recent_idx) {
            flags.insert(AnomalyFlags::OSCILLATION);
        }

        let max_z = z_cache_miss.abs().max(z_branch_miss.abs()).max(z_ipc.abs());
        let mut composite_score = 1.0 - 1.0 / (1.0 + max_z / self.z_threshold);
        composite_score = composite_score.clamp(0.0, 1.0);

        DetectionResult {
            z_cache_miss,
            z_branch_miss,
            z_ipc,
            composite_score,
            flags,
            sustained_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_with(cmr: f32, bmr: f32, ipc: f32) -> Sample {
        Sample {
            timestamp_ns: 0,
            cycles: 0,
            instructions: 0,
            cache_references: 0,
            cache_misses: 0,
            branch_instructions: 0,
            branch_misses: 0,
            cache_miss_rate: cmr,
            branch_miss_rate: bmr,
            ipc,
        }
    }

    #[test]
    fn degenerate_stddev_yields_zero_z_score() {
        let mut learning = Learning::new(3.5, 10);
        for _ in 0..5 {
            learning.observe(&sample_with(0.1, 0.1, 1.0));
        }
        let mut ready = learning.finalize();
        let result = ready.detect(&sample_with(0.9, 0.1, 1.0));
        // stddev is exactly zero, compute_z must short-circuit rather than divide
        assert_eq!(result.z_cache_miss, 0.0);
    }

    #[test]
    fn cache_miss_spike_raises_flag_and_score() {
        let mut learning = Learning::new(2.0, 10);
        for i in 0..50 {
            let jitter = if i % 2 == 0 { 0.01 } else { 0.02 };
            learning.observe(&sample_with(jitter, 0.05, 1.0));
        }
        let mut ready = learning.finalize();
        let result = ready.detect(&sample_with(0.9, 0.05, 1.0));
        assert!(result.flags.contains(AnomalyFlags::CACHE_MISS_SPIKE));
        assert!(result.composite_score > 0.0);
    }

    #[test]
    fn ipc_collapse_is_negative_tail_only() {
        let mut learning = Learning::new(2.0, 10);
        for _ in 0..50 {
            learning.observe(&sample_with(0.01, 0.01, 2.0));
        }
        let mut ready = learning.finalize();
        // a spike in IPC should not be flagged as collapse, only a drop
        let spike = ready.detect(&sample_with(0.01, 0.01, 4.0));
        assert!(!spike.flags.contains(AnomalyFlags::IPC_COLLAPSE));
        let collapse = ready.detect(&sample_with(0.01, 0.01, 0.1));
        assert!(collapse.flags.contains(AnomalyFlags::IPC_COLLAPSE));
    }

    #[test]
    fn burst_pattern_after_consecutive_anomalies() {
        let mut learning = Learning::new(1.0, 3);
        for _ in 0..50 {
            learning.observe(&sample_with(0.01, 0.01, 1.0));
        }
        let mut ready = learning.finalize();
        let mut last = DetectionResult::default();
        for _ in 0..3 {
            last = ready.detect(&sample_with(0.9, 0.01, 1.0));
        }
        assert!(last.flags.contains(AnomalyFlags::BURST_PATTERN));
        assert_eq!(last.sustained_count, 3);
    }

    #[test]
    fn composite_score_is_bounded() {
        let mut learning = Learning::new(1.0, 10);
        for _ in 0..20 {
            learning.observe(&sample_with(0.01, 0.01, 1.0));
        }
        let mut ready = learning.finalize();
        let result = ready.detect(&sample_with(50.0, 0.01, 1.0));
        assert!(result.composite_score <= 1.0 && result.composite_score >= 0.0);
    }

    #[test]
    fn flags_display_matches_flag_names() {
        let mut flags = AnomalyFlags::NONE;
        assert_eq!(flags.to_string(), "none");
        flags.insert(AnomalyFlags::BURST_PATTERN);
        flags.insert(AnomalyFlags::OSCILLATION);
        assert_eq!(flags.to_string(), "burst_pattern oscillation");
    }
}
