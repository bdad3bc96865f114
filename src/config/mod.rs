//! Runtime configuration: compiled-in defaults, an optional `key=value` file, and CLI
//! overrides applied on top, in that order, matching the original layering.

use std::path::Path;

use crate::error::{GuardianError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub sampling_interval_us: u32,
    pub learning_duration_sec: u32,
    pub z_threshold: f64,
    pub burst_window: u32,
    pub ringbuffer_capacity: u32,
    pub target_cpu: i32,
    pub target_pid: i32,
    pub log_file: String,
    pub log_to_file: bool,
    pub log_to_syslog: bool,
    pub verbose: bool,
    pub risk_decay_factor: f64,
    pub correlation_window_sec: u32,
    pub alert_cooldown_sec: u32,
    pub pmu_test: bool,
    pub socket_path: String,
    pub enable_ml_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sampling_interval_us: 1000,
            learning_duration_sec: 60,
            z_threshold: 3.5,
            burst_window: 10,
            ringbuffer_capacity: 8192,
            target_cpu: -1,
            target_pid: -1,
            log_file: "/var/log/cpu-guardian.log".to_string(),
            log_to_file: false,
            log_to_syslog: false,
            verbose: false,
            risk_decay_factor: 0.95,
            correlation_window_sec: 30,
            alert_cooldown_sec: 5,
            pmu_test: false,
            socket_path: "/tmp/cpu-guardian.sock".to_string(),
            enable_ml_output: true,
        }
    }
}

fn trim(s: &str) -> &str {
    s.trim()
}

fn parse_bool(v: &str) -> bool {
    v == "true" || v == "1"
}

impl Config {
    fn apply_kv(&mut self, key: &str, val: &str) -> std::result::Result<(), String> {
        match key {
            "sampling_interval_us" => {
                self.sampling_interval_us = val.parse().map_err(|_| key.to_string())?
            }
            "learning_duration_sec" => {
                self.learning_duration_sec = val.parse().map_err(|_| key.to_string())?
            }
            "z_threshold" => self.z_threshold = val.parse().map_err(|_| key.to_string())?,
            "burst_window" => self.burst_window = val.parse().map_err(|_| key.to_string())?,
            "ringbuffer_capacity" => {
                self.ringbuffer_capacity = val.parse().map_err(|_| key.to_string())?
            }
            "target_cpu" => self.target_cpu = val.parse().map_err(|_| key.to_string())?,
            "target_pid" => self.target_pid = val.parse().map_err(|_| key.to_string())?,
            "log_file" => {
                self.log_file = val.to_string();
                self.log_to_file = true;
            }
            "log_to_syslog" => self.log_to_syslog = parse_bool(val),
            "verbose" => self.verbose = parse_bool(val),
            "risk_decay_factor" => {
                self.risk_decay_factor = val.parse().map_err(|_| key.to_string())?
            }
            "correlation_window_sec" => {
                self.correlation_window_sec = val.parse().map_err(|_| key.to_string())?
            }
            "alert_cooldown_sec" => {
                self.alert_cooldown_sec = val.parse().map_err(|_| key.to_string())?
            }
            "socket_path" => self.socket_path = val.to_string(),
            "enable_ml_output" => self.enable_ml_output = parse_bool(val),
            other => {
                tracing::warn!(key = other, "unknown configuration key");
                return Err(other.to_string());
            }
        }
        Ok(())
    }

    /// Loads `key=value` lines from `path`, skipping blank lines and `#` comments.
    /// Parses every line before returning; a syntax error or unknown key is reported
    /// with its line number but does not stop the rest of the file from loading.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path).map_err(|e| GuardianError::Configuration(
            format!("failed to read {}: {e}", path.display()),
        ))?;

        let mut errors = 0u32;
        for (lineno, raw_line) in contents.lines().enumerate() {
            let line = trim(raw_line);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, val)) = line.split_once('=') else {
                tracing::warn!(line = lineno + 1, "config syntax error, expected key=value");
                errors += 1;
                continue;
            };

            if self.apply_kv(trim(key), trim(val)).is_err() {
                errors += 1;
            }
        }

        if errors > 0 {
            return Err(GuardianError::Configuration(format!(
                "{errors} error(s) while loading {}",
                path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let cfg = Config::default();
        assert_eq!(cfg.sampling_interval_us, 1000);
        assert_eq!(cfg.learning_duration_sec, 60);
        assert_eq!(cfg.z_threshold, 3.5);
        assert_eq!(cfg.ringbuffer_capacity, 8192);
        assert_eq!(cfg.target_cpu, -1);
        assert_eq!(cfg.target_pid, -1);
        assert_eq!(cfg.risk_decay_factor, 0.95);
        assert_eq!(cfg.alert_cooldown_sec, 5);
        assert!(cfg.enable_ml_output);
    }

    #[test]
    fn load_file_parses_known_keys_and_skips_comments() {
        let dir = std::env::temp_dir().join(format!("cpu-guardian-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cfg.conf");
        std::fs::write(
            &path,
            "# comment\n\nsampling_interval_us = 2000\nverbose=true\n",
        )
        .unwrap();

        let mut cfg = Config::default();
        cfg.load_file(&path).unwrap();
        assert_eq!(cfg.sampling_interval_us, 2000);
        assert!(cfg.verbose);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_file_continues_past_errors_but_reports_them() {
        let dir = std::env::temp_dir().join(format!("cpu-guardian-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cfg.conf");
        std::fs::write(&path, "not_a_key_value\nverbose=true\nbogus_key=1\n").unwrap();

        let mut cfg = Config::default();
        let result = cfg.load_file(&path);
        assert!(result.is_err());
        assert!(cfg.verbose);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
