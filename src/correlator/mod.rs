//! Per-process risk aggregation: folds per-sample anomaly scores into an EMA-smoothed,
//! time-decaying risk score per PID, bounded to [`MAX_TRACKED`] concurrently tracked
//! processes.

use std::fs;

/// Hard cap on concurrently tracked processes; avoids unbounded growth in a
/// long-running daemon that never restarts.
pub const MAX_TRACKED: usize = 256;

const EMA_ALPHA: f32 = 0.3;
const SUSPICIOUS_THRESHOLD: f32 = 0.5;
const DECAY_FLOOR: f32 = 0.001;

/// Aggregated risk state for one tracked process.
#[derive(Debug, Clone)]
pub struct ProcessRisk {
    pub pid: i32,
    pub tid: i32,
    pub comm: String,
    pub anomaly_score: f32,
    pub suspicious_samples: u64,
    pub total_samples: u64,
    pub last_seen_ns: u64,
    pub active: bool,
}

impl ProcessRisk {
    fn new(pid: i32, tid: i32, comm: String) -> ProcessRisk {
        ProcessRisk {
            pid,
            tid,
            comm,
            anomaly_score: 0.0,
            suspicious_samples: 0,
            total_samples: 0,
            last_seen_ns: 0,
            active: true,
        }
    }
}

/// Resolves a human-readable name for a PID. Abstracted so tests can inject names
/// without touching `/proc`.
pub trait ResolveName {
    fn resolve(&self, pid: i32) -> String;
}

/// Production resolver reading `/proc/<pid>/comm`.
pub struct ProcFsResolver;

impl ResolveName for ProcFsResolver {
    fn resolve(&self, pid: i32) -> String {
        if pid <= 0 {
            return "<unknown>".to_string();
        }
        match fs::read_to_string(format!("/proc/{pid}/comm")) {
            Ok(contents) => contents.trim_end_matches('\n').to_string(),
            Err(_) => "<unknown>".to_string(),
        }
    }
}

/// Bounded table of per-process risk entries with slot reuse, grounded one-to-one on
/// `correlation_engine_t`'s fixed-array design (no heap churn per update).
pub struct Correlator<R: ResolveName = ProcFsResolver> {
    entries: Vec<ProcessRisk>,
    decay_factor: f64,
    window_ns: u64,
    resolver: R,
}

impl Correlator<ProcFsResolver> {
    pub fn new(decay_factor: f64, window_sec: u32) -> Self {
        Correlator::with_resolver(decay_factor, window_sec, ProcFsResolver)
    }
}

impl<R: ResolveName> Correlator<R> {
    pub fn with_resolver(decay_factor: f64, window_sec: u32, resolver: R) -> Self {
        Correlator {
            entries: Vec::with_capacity(MAX_TRACKED),
            decay_factor,
            window_ns: window_sec as u64 * 1_000_000_000,
            resolver,
        }
    }

    fn find_or_create(&mut self, pid: i32, tid: i32) -> Option<usize> {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.pid == pid && e.active)
        {
            return Some(idx);
        }

        if let Some(idx) = self.entries.iter().position(|e| !e.active) {
            let comm = self.resolver.resolve(pid);
            self.entries[idx] = ProcessRisk::new(pid, tid, comm);
            return Some(idx);
        }

        if self.entries.len() >= MAX_TRACKED {
            return None;
        }

        let comm = self.resolver.resolve(pid);
        self.entries.push(ProcessRisk::new(pid, tid, comm));
        Some(self.entries.len() - 1)
    }

    /// Folds one anomaly score for `pid`/`tid` into its EMA risk score.
    pub fn update(&mut self, pid: i32, tid: i32, score: f32, timestamp_ns: u64) {
        let Some(idx) = self.find_or_create(pid, tid) else {
            return;
        };
        let entry = &mut self.entries[idx];
        entry.total_samples += 1;
        entry.last_seen_ns = timestamp_ns;
        entry.anomaly_score = EMA_ALPHA * score + (1.0 - EMA_ALPHA) * entry.anomaly_score;
        if score > SUSPICIOUS_THRESHOLD {
            entry.suspicious_samples += 1;
        }
    }

    /// Attenuates every active entry's score and deactivates entries outside the
    /// inactivity window. Call roughly once per second.
    pub fn decay(&mut self, now_ns: u64) {
        for entry in &mut self.entries {
            if !entry.active {
                continue;
            }
            let age = now_ns.saturating_sub(entry.last_seen_ns);
            if age > self.window_ns {
                entry.active = false;
                continue;
            }
            entry.anomaly_score *= self.decay_factor as f32;
            if entry.anomaly_score < DECAY_FLOOR {
                entry.anomaly_score = 0.0;
            }
        }
    }

    pub fn lookup(&self, pid: i32) -> Option<&ProcessRisk> {
        self.entries.iter().find(|e| e.pid == pid && e.active)
    }

    /// Returns the active entry with the highest risk score. Ties are broken by first
    /// insertion order, matching `correlation_top_risk`'s strict `>` comparison (not
    /// `Iterator::max_by`, which would keep the *last* of equally-scored entries).
    pub fn top_risk(&self) -> Option<&ProcessRisk> {
        let mut best: Option<&ProcessRisk> = None;
        for entry in self.entries.iter().filter(|e| e.active) {
            if best.map_or(true, |b| entry.anomaly_score > b.anomaly_score) {
                best = Some(entry);
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedNames;
    impl ResolveName for FixedNames {
        fn resolve(&self, pid: i32) -> String {
            format!("proc-{pid}")
        }
    }

    #[test]
    fn update_creates_and_resolves_entry() {
        let mut corr = Correlator::with_resolver(0.95, 30, FixedNames);
        corr.update(100, 0, 0.9, 1_000);
        let risk = corr.lookup(100).unwrap();
        assert_eq!(risk.comm, "proc-100");
        assert_eq!(risk.total_samples, 1);
        assert_eq!(risk.suspicious_samples, 1);
        assert!((risk.anomaly_score - 0.27).abs() < 1e-6);
    }

    #[test]
    fn ema_blends_with_history() {
        let mut corr = Correlator::with_resolver(0.95, 30, FixedNames);
        corr.update(1, 0, 1.0, 0);
        corr.update(1, 0, 0.0, 1);
        // 0.3*1.0 = 0.3, then 0.3*0.0 + 0.7*0.3 = 0.21
        let risk = corr.lookup(1).unwrap();
        assert!((risk.anomaly_score - 0.21).abs() < 1e-6);
    }

    #[test]
    fn decay_deactivates_stale_entries() {
        let mut corr = Correlator::with_resolver(0.5, 10, FixedNames);
        corr.update(5, 0, 1.0, 0);
        corr.decay(20_000_000_000); // 20s later, window is 10s
        assert!(corr.lookup(5).is_none());
    }

    #[test]
    fn decay_floors_tiny_scores_to_zero() {
        let mut corr = Correlator::with_resolver(0.01, 30, FixedNames);
        corr.update(5, 0, 0.1, 0);
        corr.decay(1);
        let risk = corr.lookup(5).unwrap();
        assert_eq!(risk.anomaly_score, 0.0);
    }

    #[test]
    fn top_risk_picks_highest_active_score() {
        let mut corr = Correlator::with_resolver(0.95, 30, FixedNames);
        corr.update(1, 0, 0.2, 0);
        corr.update(2, 0, 0.8, 0);
        assert_eq!(corr.top_risk().unwrap().pid, 2);
    }

    #[test]
    fn top_risk_ties_favor_first_inserted() {
        let mut corr = Correlator::with_resolver(0.95, 30, FixedNames);
        corr.update(1, 0, 0.5, 0);
        corr.update(2, 0, 0.5, 0);
        assert_eq!(corr.top_risk().unwrap().pid, 1);
    }

    #[test]
    fn inactive_slot_is_reused_before_growing() {
        let mut corr = Correlator::with_resolver(0.5, 1, FixedNames);
        corr.update(1, 0, 0.5, 0);
        corr.decay(5_000_000_000); // past the 1s window, deactivates pid 1
        corr.update(2, 0, 0.5, 5_000_000_000);
        assert_eq!(corr.entries.len(), 1);
        assert_eq!(corr.entries[0].pid, 2);
    }

    #[test]
    fn tracked_table_is_bounded() {
        let mut corr = Correlator::with_resolver(0.95, 3600, FixedNames);
        for pid in 0..(MAX_TRACKED as i32 + 10) {
            corr.update(pid, 0, 0.9, 0);
        }
        assert_eq!(corr.entries.len(), MAX_TRACKED);
    }
}
