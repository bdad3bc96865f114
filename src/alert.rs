//! Structured alert emission with rate-limited cooldown, grounded on `logger.c`'s
//! `logger_alert`. Unlike the original's hand-rolled `json_escape`, escaping here is
//! delegated to `serde_json`'s string serializer, which performs the same `"`/`\`/
//! control-character rules by construction.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;

/// Severity assigned to an alert, mirrors the three syslog-ish levels the original
/// distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Info,
    Warning,
    Critical,
}

#[derive(Serialize)]
struct AlertRecord<'a> {
    level: Level,
    timestamp: u64,
    pid: i32,
    comm: &'a str,
    anomaly_score: f64,
    reason: &'a str,
}

/// Where alerts and informational lines go. A production implementation fans out to
/// stdout/file/syslog; tests substitute an in-memory collector.
pub trait AlertSink: Send {
    fn alert(&mut self, level: Level, timestamp_ns: u64, pid: i32, comm: &str, score: f64, reason: &str);
    fn info(&mut self, message: &str);
}

/// Production sink: stdout always, optionally a log file, optionally syslog, with a
/// cooldown window gating alert emission (not `info` lines).
pub struct StdioSink {
    file: Option<File>,
    to_syslog: bool,
    cooldown_ns: u64,
    last_alert_ns: Option<u64>,
}

impl StdioSink {
    pub fn new(log_file: Option<&str>, to_syslog: bool, cooldown_sec: u32) -> std::io::Result<Self> {
        let file = match log_file {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            None => None,
        };
        Ok(StdioSink {
            file,
            to_syslog,
            cooldown_ns: cooldown_sec as u64 * 1_000_000_000,
            last_alert_ns: None,
        })
    }
}

fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

impl AlertSink for StdioSink {
    fn alert(&mut self, level: Level, timestamp_ns: u64, pid: i32, comm: &str, score: f64, reason: &str) {
        // Cooldown is gated on the wall-clock moment this alert is emitted, not the
        // timestamp carried in the record, matching `logger_alert`'s own `get_ns()` call
        // (distinct from the `sample.timestamp_ns` it receives as an argument).
        let now = now_ns();
        if self.cooldown_ns > 0 {
            if let Some(last) = self.last_alert_ns {
                if now.saturating_sub(last) < self.cooldown_ns {
                    return;
                }
            }
        }
        self.last_alert_ns = Some(now);

        let record = AlertRecord {
            level,
            timestamp: timestamp_ns,
            pid,
            comm,
            anomaly_score: (score * 10_000.0).round() / 10_000.0,
            reason,
        };
        let json = match serde_json::to_string(&record) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize alert record");
                return;
            }
        };

        println!("{json}");

        if let Some(file) = &mut self.file {
            if writeln!(file, "{json}").is_ok() {
                let _ = file.flush();
            }
        }

        if self.to_syslog {
            // tracing's own target acts as the syslog-equivalent structured channel here.
            match level {
                Level::Info => tracing::info!(target: "syslog", "{json}"),
                Level::Warning => tracing::warn!(target: "syslog", "{json}"),
                Level::Critical => tracing::error!(target: "syslog", "{json}"),
            }
        }
    }

    fn info(&mut self, message: &str) {
        println!("[cpu-guardian] {message}");
        if let Some(file) = &mut self.file {
            if writeln!(file, "[cpu-guardian] {message}").is_ok() {
                let _ = file.flush();
            }
        }
    }
}

/// In-memory collector for tests: records every call instead of touching stdout/disk.
#[derive(Default)]
pub struct MemorySink {
    pub alerts: Mutex<Vec<(Level, u64, i32, String, f64, String)>>,
    pub info_lines: Mutex<Vec<String>>,
}

impl AlertSink for MemorySink {
    fn alert(&mut self, level: Level, timestamp_ns: u64, pid: i32, comm: &str, score: f64, reason: &str) {
        self.alerts
            .lock()
            .unwrap()
            .push((level, timestamp_ns, pid, comm.to_string(), score, reason.to_string()));
    }

    fn info(&mut self, message: &str) {
        self.info_lines.lock().unwrap().push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_escaping_handles_quotes_and_control_chars() {
        let record = AlertRecord {
            level: Level::Warning,
            timestamp: 1,
            pid: 2,
            comm: "ev\"il\\name\n",
            anomaly_score: 0.5,
            reason: "cache_miss_spike",
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\\\""));
        assert!(json.contains("\\\\"));
        assert!(json.contains("\\n"));
    }

    #[test]
    fn memory_sink_records_alerts() {
        let mut sink = MemorySink::default();
        sink.alert(Level::Critical, 100, 42, "victim", 0.9, "burst_pattern");
        let alerts = sink.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].2, 42);
    }
}
