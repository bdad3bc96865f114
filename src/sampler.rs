//! Dedicated sampling thread: opens the PMU, optionally pins itself to a CPU core, and
//! periodically derives a [`Sample`] from consecutive raw reads, pushing it into the
//! ring. Grounded on `telemetry.c`'s `sampling_loop`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::pmu::Pmu;
use crate::ring::RingProducer;
use crate::sample::{Reading, Sample};

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

fn pin_to_cpu(cpu: i32) {
    if cpu < 0 {
        return;
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            tracing::warn!(cpu, error = %std::io::Error::last_os_error(), "failed to pin sampler thread to CPU");
        }
    }
}

/// Spawns the sampler thread. The thread owns the PMU handle exclusively and tears it
/// down on exit; the caller only interacts with it through `shutdown` and `join`.
pub fn spawn(
    interval_us: u32,
    cpu: i32,
    pid: i32,
    producer: RingProducer,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        pin_to_cpu(cpu);

        let pmu = match Pmu::open(cpu, pid) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "sampler failed to open PMU counters");
                return;
            }
        };
        tracing::info!(open_counters = pmu.count_open(), "PMU counters initialized");

        if let Err(e) = pmu.enable() {
            tracing::error!(error = %e, "sampler failed to enable PMU counters");
            return;
        }

        let interval = Duration::from_micros(interval_us as u64);
        let mut prev: Option<Reading> = None;

        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(interval);

            let cur = match pmu.read() {
                Ok(r) => r,
                Err(_) => continue,
            };

            if let Some(prev_reading) = prev {
                let sample = Sample::from_readings(now_ns(), &cur, &prev_reading);
                producer.push(sample);
            }
            prev = Some(cur);
        }

        let _ = pmu.disable();
    })
}
