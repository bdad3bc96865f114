use std::sync::atomic::Ordering;

use clap::Parser;
use cpu_guardian::alert::{AlertSink, StdioSink};
use cpu_guardian::anomaly::Learning;
use cpu_guardian::cli::Cli;
use cpu_guardian::config::Config;
use cpu_guardian::correlator::Correlator;
use cpu_guardian::error::GuardianError;
use cpu_guardian::orchestrator;
use cpu_guardian::pmu::Pmu;
use cpu_guardian::ring;
use cpu_guardian::wire::Egress;

const BANNER: &str = r#"
====================================================
      CPU Guardian - Side-Channel Detector
      Real-Time PMU Anomaly Detection Engine
====================================================
"#;

fn main() {
    println!("{BANNER}");

    let cli = Cli::parse();
    let mut cfg = Config::default();
    if let Err(e) = cli.apply(&mut cfg) {
        eprintln!("[cpu-guardian] configuration error: {e}");
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if cfg.verbose {
        tracing::info!(?cfg, "active configuration");
    }

    if cfg.pmu_test {
        std::process::exit(run_pmu_test(cfg.target_cpu, cfg.target_pid));
    }

    std::process::exit(run(cfg));
}

fn run_pmu_test(cpu: i32, pid: i32) -> i32 {
    let pmu = match Pmu::open(cpu, pid) {
        Ok(p) => p,
        Err(source) => {
            let err = GuardianError::ResourceInit {
                resource: "PMU counters",
                source,
            };
            eprintln!("[cpu-guardian] PMU test failed: {err}");
            eprintln!("[cpu-guardian] If ENOENT: VM may not expose PMU; try bare metal or enable PMU passthrough.");
            eprintln!("[cpu-guardian] If EACCES: run with sudo and ensure perf_event_paranoid <= 2");
            return 1;
        }
    };
    let reading = match pmu.read() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("[cpu-guardian] PMU test failed: read failed ({e})");
            return 1;
        }
    };
    println!("PMU raw read (counters open: {}):", pmu.count_open());
    println!("  cycles              = {}", reading.cycles);
    println!("  instructions        = {}", reading.instructions);
    println!("  cache_references    = {}", reading.cache_references);
    println!("  cache_misses        = {}", reading.cache_misses);
    println!("  branch_instructions = {}", reading.branch_instructions);
    println!("  branch_misses       = {}", reading.branch_misses);
    println!("[cpu-guardian] PMU test OK");
    0
}

fn run(cfg: Config) -> i32 {
    let shutdown = orchestrator::install_shutdown_handler();

    let mut sink = match StdioSink::new(
        cfg.log_to_file.then_some(cfg.log_file.as_str()),
        cfg.log_to_syslog,
        cfg.alert_cooldown_sec,
    ) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[cpu-guardian] failed to initialize logger: {e}");
            return 1;
        }
    };

    sink.info(&format!(
        "starting up (interval={}us, learning={}s, z={:.2})",
        cfg.sampling_interval_us, cfg.learning_duration_sec, cfg.z_threshold
    ));

    let (producer, consumer) = ring::channel(cfg.ringbuffer_capacity as usize);

    let sampler_handle = cpu_guardian::sampler::spawn(
        cfg.sampling_interval_us,
        cfg.target_cpu,
        cfg.target_pid,
        producer,
        shutdown.clone(),
    );

    sink.info(&format!(
        "telemetry engine started on cpu={} pid={}",
        cfg.target_cpu, cfg.target_pid
    ));

    let mut learning = Learning::new(cfg.z_threshold, cfg.burst_window);
    let mut correlator = Correlator::new(cfg.risk_decay_factor, cfg.correlation_window_sec);

    let egress = if cfg.enable_ml_output {
        match Egress::connect(&cfg.socket_path) {
            Ok(e) => {
                sink.info(&format!("ML IPC connected: {}", cfg.socket_path));
                Some(e)
            }
            Err(_) => {
                sink.info(&format!(
                    "ML IPC unavailable ({}), using detection-only mode",
                    cfg.socket_path
                ));
                None
            }
        }
    } else {
        None
    };

    sink.info(&format!(
        "entering learning phase ({} seconds)...",
        cfg.learning_duration_sec
    ));

    let learned = orchestrator::run_learning_phase(
        &consumer,
        &mut learning,
        cfg.learning_duration_sec,
        &shutdown,
        egress.as_ref(),
    );

    if shutdown.load(Ordering::Relaxed) {
        return shutdown_and_report(sampler_handle, &mut sink, 0, 0);
    }

    if learned == 0 {
        let err = GuardianError::BaselineInvalid(
            "no samples collected during learning phase".to_string(),
        );
        eprintln!("[cpu-guardian] FATAL: {err}, aborting");
        eprintln!("[cpu-guardian] Check PMU access (perf_event_paranoid, VM restrictions) or run with --pmu-test");
        shutdown.store(true, Ordering::Relaxed);
        let _ = sampler_handle.join();
        return 1;
    }

    let mut ready = learning.finalize();
    sink.info(&format!("learning complete: {learned} samples collected"));

    if let Err(e) = orchestrator::drop_privileges() {
        tracing::warn!(error = %e, "failed to drop privileges");
    }

    sink.info("entering detection phase...");

    let stats = orchestrator::run_detection_phase(
        &consumer,
        &mut ready,
        &mut correlator,
        &mut sink,
        egress.as_ref(),
        cfg.target_pid,
        cfg.verbose,
        &shutdown,
    );

    shutdown_and_report(
        sampler_handle,
        &mut sink,
        stats.total_samples,
        stats.anomaly_samples,
    )
}

fn shutdown_and_report(
    sampler_handle: std::thread::JoinHandle<()>,
    sink: &mut StdioSink,
    total_samples: u64,
    anomaly_samples: u64,
) -> i32 {
    sink.info("shutting down...");
    let _ = sampler_handle.join();
    println!(
        "\n[cpu-guardian] exited cleanly. Total samples: {total_samples}, Anomalies: {anomaly_samples}"
    );
    0
}
