//! Hardware PMU access via `perf_event_open(2)`.
//!
//! A leader counter owns the group, siblings are opened against its fd. This module only
//! ever opens the six fixed hardware/software events [`Sample`](crate::sample::Sample)
//! needs; there is no general event/sampling API here.

mod syscall {
    pub use crate::ffi::syscall::*;
}

use std::fs::File;
use std::io;

use crate::ffi::bindings::*;
use crate::ffi::Attr;
use crate::sample::Reading;

/// Number of tracked counter slots; cycles and instructions are mandatory, the rest
/// are best-effort.
pub const NUM_COUNTERS: usize = 6;
const CRITICAL_MIN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Cycles = 0,
    Instructions = 1,
    CacheMiss = 2,
    BranchMiss = 3,
    BranchInstructions = 4,
    CacheReferences = 5,
}

const SLOTS: [Slot; NUM_COUNTERS] = [
    Slot::Cycles,
    Slot::Instructions,
    Slot::CacheMiss,
    Slot::BranchMiss,
    Slot::BranchInstructions,
    Slot::CacheReferences,
];

/// An open PMU session: up to six grouped counters, with cycles as the group leader.
pub struct Pmu {
    fds: [Option<File>; NUM_COUNTERS],
    group_leader: Option<i32>,
}

fn fill_attr(ty: u32, config: u64) -> Attr {
    let mut attr = Attr::default();
    attr.size = perf_event_attr::attr_size();
    attr.type_ = ty;
    attr.config = config;
    attr.flags = ATTR_FLAG_DISABLED | ATTR_FLAG_INHERIT;
    attr.read_format = PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING;
    attr
}

fn warn_perf_paranoid() {
    if let Ok(contents) = std::fs::read_to_string("/proc/sys/kernel/perf_event_paranoid") {
        if let Ok(val) = contents.trim().parse::<i32>() {
            if val > 2 {
                tracing::warn!(
                    paranoid = val,
                    "perf_event_paranoid above 2, hardware counters may fail to open"
                );
            }
        }
    }
}

fn detect_hypervisor() {
    if let Ok(contents) = std::fs::read_to_string("/proc/cpuinfo") {
        if contents.lines().any(|l| l.contains("hypervisor")) {
            tracing::warn!("running inside a virtualized environment, PMU access may be restricted");
        }
    }
}

fn open_one(attr: &Attr, pid: i32, cpu: i32, group_fd: i32) -> io::Result<File> {
    let result = syscall::perf_event_open(attr, pid, cpu, group_fd, 0);
    if let Err(ref e) = result {
        tracing::debug!(
            type_ = attr.type_,
            config = attr.config,
            pid,
            cpu,
            error = %e,
            "perf_event_open failed"
        );
    }
    result
}

fn open_with_fallback(
    pid: i32,
    cpu: i32,
    group_fd: i32,
    slot_name: &str,
    alternatives: &[(u32, u64)],
) -> Option<File> {
    for &(ty, config) in alternatives {
        let attr = fill_attr(ty, config);
        if let Ok(f) = open_one(&attr, pid, cpu, group_fd) {
            tracing::debug!(slot = slot_name, type_ = ty, config, "opened event");
            return Some(f);
        }
    }
    tracing::warn!(slot = slot_name, "all alternatives failed to open");
    None
}

impl Pmu {
    /// Opens the PMU counter group for `cpu` (-1 = any CPU) and `pid` (0 = calling
    /// process, -1 = system-wide, requires privilege). Falls back from cpu=-1 to cpu=0
    /// on `ENOENT`, matching VM/container environments that reject "any CPU" groups.
    pub fn open(cpu: i32, pid: i32) -> io::Result<Pmu> {
        warn_perf_paranoid();
        detect_hypervisor();

        let (mut pid, mut cpu) = (pid, cpu);
        if pid == -1 && cpu == -1 {
            tracing::warn!("invalid pid/cpu combination (both -1), defaulting to current process");
            pid = 0;
        }

        let mut use_cpu = cpu;
        if cpu == -1 {
            let probe = fill_attr(PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES);
            match syscall::perf_event_open(&probe, pid, -1, -1, 0) {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                    tracing::warn!("cpu=-1 not supported (ENOENT), using cpu=0");
                    use_cpu = 0;
                }
                _ => {}
            }
        }

        let mut fds: [Option<File>; NUM_COUNTERS] = Default::default();

        let cycles_attr = fill_attr(PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES);
        let cycles = open_one(&cycles_attr, pid, use_cpu, -1).map_err(|e| {
            tracing::error!(error = %e, "failed to open mandatory cycles counter");
            e
        })?;
        let group_fd = {
            use std::os::fd::AsRawFd;
            cycles.as_raw_fd()
        };
        fds[Slot::Cycles as usize] = Some(cycles);

        let insn_attr = fill_attr(PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS);
        let insn = open_one(&insn_attr, pid, use_cpu, group_fd).map_err(|e| {
            tracing::error!(error = %e, "failed to open mandatory instructions counter");
            e
        })?;
        fds[Slot::Instructions as usize] = Some(insn);

        fds[Slot::CacheMiss as usize] = open_with_fallback(
            pid,
            use_cpu,
            group_fd,
            "cache_misses",
            &[
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES),
                (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
            ],
        );

        fds[Slot::BranchMiss as usize] = open_with_fallback(
            pid,
            use_cpu,
            group_fd,
            "branch_misses",
            &[(PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES)],
        );

        fds[Slot::BranchInstructions as usize] = open_with_fallback(
            pid,
            use_cpu,
            group_fd,
            "branch_instructions",
            &[(PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS)],
        );

        fds[Slot::CacheReferences as usize] = open_with_fallback(
            pid,
            use_cpu,
            group_fd,
            "cache_references",
            &[(PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES)],
        );

        let open_count = fds.iter().filter(|f| f.is_some()).count();
        if open_count < CRITICAL_MIN {
            tracing::error!(
                open_count,
                required = CRITICAL_MIN,
                "insufficient counters open"
            );
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "insufficient PMU counters opened",
            ));
        }

        let pmu = Pmu {
            fds,
            group_leader: Some(group_fd),
        };

        pmu.group_ioctl(PERF_EVENT_IOC_RESET)?;
        pmu.group_ioctl(PERF_EVENT_IOC_ENABLE)?;

        Ok(pmu)
    }

    fn group_ioctl(&self, op: u64) -> io::Result<()> {
        let leader = match self.group_leader {
            Some(l) => l,
            None => return Ok(()),
        };
        let file = self.fds[Slot::Cycles as usize].as_ref().expect("leader fd present");
        debug_assert_eq!(
            {
                use std::os::fd::AsRawFd;
                file.as_raw_fd()
            },
            leader
        );
        syscall::ioctl_arg(file, op, PERF_IOC_FLAG_GROUP).map(|_| ())
    }

    pub fn count_open(&self) -> usize {
        self.fds.iter().filter(|f| f.is_some()).count()
    }

    pub fn enable(&self) -> io::Result<()> {
        self.group_ioctl(PERF_EVENT_IOC_ENABLE)
    }

    pub fn disable(&self) -> io::Result<()> {
        self.group_ioctl(PERF_EVENT_IOC_DISABLE)
    }

    pub fn reset(&self) -> io::Result<()> {
        self.group_ioctl(PERF_EVENT_IOC_RESET)
    }

    /// Reads all open counters, applying the `time_enabled`/`time_running` scaling
    /// correction for multiplexed counters.
    pub fn read(&self) -> io::Result<Reading> {
        let mut values = [0u64; NUM_COUNTERS];
        for &slot in &SLOTS {
            let idx = slot as usize;
            if let Some(file) = &self.fds[idx] {
                values[idx] = read_scaled(file)?;
            }
        }

        Ok(Reading {
            cache_references: values[Slot::CacheReferences as usize],
            cache_misses: values[Slot::CacheMiss as usize],
            branch_instructions: values[Slot::BranchInstructions as usize],
            branch_misses: values[Slot::BranchMiss as usize],
            instructions: values[Slot::Instructions as usize],
            cycles: values[Slot::Cycles as usize],
        })
    }
}

impl Drop for Pmu {
    fn drop(&mut self) {
        let _ = self.disable();
    }
}

fn read_scaled(file: &File) -> io::Result<u64> {
    let mut buf = [0u8; 24];
    let n = syscall::read(file, &mut buf)?;
    if n != buf.len() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short perf read"));
    }
    let value = u64::from_ne_bytes(buf[0..8].try_into().unwrap());
    let time_enabled = u64::from_ne_bytes(buf[8..16].try_into().unwrap());
    let time_running = u64::from_ne_bytes(buf[16..24].try_into().unwrap());

    let scaled = if time_running == 0 {
        0
    } else if time_running < time_enabled {
        (value as f64 * (time_enabled as f64 / time_running as f64)) as u64
    } else {
        value
    };
    Ok(scaled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_attr_sets_expected_read_format() {
        let attr = fill_attr(PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES);
        assert_eq!(
            attr.read_format,
            PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING
        );
        assert_eq!(attr.flags & ATTR_FLAG_DISABLED, ATTR_FLAG_DISABLED);
        assert_eq!(attr.flags & ATTR_FLAG_INHERIT, ATTR_FLAG_INHERIT);
    }
}
