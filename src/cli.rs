//! Command-line override layer, mirroring the original flag set one-to-one so existing
//! deployment scripts keep working: `-c/-i/-l/-z/-C/-p/-o/-s/-v/-T/-S/-M`.

use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "cpu-guardian", about = "Real-time PMU anomaly detection daemon")]
pub struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Sampling interval, in microseconds
    #[arg(short = 'i', long = "interval")]
    pub sampling_interval_us: Option<u32>,

    /// Learning phase duration, in seconds
    #[arg(short = 'l', long = "learn")]
    pub learning_duration_sec: Option<u32>,

    /// Z-score anomaly threshold
    #[arg(short = 'z', long = "z-threshold")]
    pub z_threshold: Option<f64>,

    /// Target CPU core (-1 = all)
    #[arg(short = 'C', long = "cpu")]
    pub target_cpu: Option<i32>,

    /// Target PID (-1 = system-wide)
    #[arg(short = 'p', long = "pid")]
    pub target_pid: Option<i32>,

    /// Log output file; setting this enables file logging
    #[arg(short = 'o', long = "log-file")]
    pub log_file: Option<String>,

    /// Enable syslog output
    #[arg(short = 's', long = "syslog")]
    pub syslog: bool,

    /// Verbose mode
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// PMU test mode: open counters, read once, print raw values, exit
    #[arg(short = 'T', long = "pmu-test")]
    pub pmu_test: bool,

    /// ML engine Unix socket path
    #[arg(short = 'S', long = "socket")]
    pub socket_path: Option<String>,

    /// Disable ML output (detection-only)
    #[arg(short = 'M', long = "no-ml")]
    pub no_ml: bool,
}

impl Cli {
    /// Applies the config file (if given via `-c`) and then every explicit CLI flag on
    /// top of `cfg`'s existing defaults, matching the original's defaults → file → CLI
    /// layering.
    pub fn apply(&self, cfg: &mut Config) -> crate::error::Result<()> {
        if let Some(path) = &self.config {
            cfg.load_file(path)?;
        }

        if let Some(v) = self.sampling_interval_us {
            cfg.sampling_interval_us = v;
        }
        if let Some(v) = self.learning_duration_sec {
            cfg.learning_duration_sec = v;
        }
        if let Some(v) = self.z_threshold {
            cfg.z_threshold = v;
        }
        if let Some(v) = self.target_cpu {
            cfg.target_cpu = v;
        }
        if let Some(v) = self.target_pid {
            cfg.target_pid = v;
        }
        if let Some(v) = &self.log_file {
            cfg.log_file = v.clone();
            cfg.log_to_file = true;
        }
        if self.syslog {
            cfg.log_to_syslog = true;
        }
        if self.verbose {
            cfg.verbose = true;
        }
        if self.pmu_test {
            cfg.pmu_test = true;
        }
        if let Some(v) = &self.socket_path {
            cfg.socket_path = v.clone();
        }
        if self.no_ml {
            cfg.enable_ml_output = false;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_win_over_defaults() {
        let cli = Cli {
            config: None,
            sampling_interval_us: Some(500),
            learning_duration_sec: None,
            z_threshold: None,
            target_cpu: None,
            target_pid: None,
            log_file: None,
            syslog: false,
            verbose: true,
            pmu_test: false,
            socket_path: None,
            no_ml: true,
        };
        let mut cfg = Config::default();
        cli.apply(&mut cfg).unwrap();
        assert_eq!(cfg.sampling_interval_us, 500);
        assert!(cfg.verbose);
        assert!(!cfg.enable_ml_output);
        // untouched fields keep their defaults
        assert_eq!(cfg.learning_duration_sec, 60);
    }
}
