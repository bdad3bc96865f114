//! Hand-written `perf_event_open(2)` ABI surface.
//!
//! Only the fields and constants this crate actually touches are defined here: the
//! full kernel UAPI struct has grown dozens of fields across versions, but the stable
//! prefix used by `cycles`/`instructions`/`cache-misses`/`cache-references`/
//! `branch-misses`/`branch-instructions` has not changed layout since Linux 2.6.

#![allow(non_camel_case_types)]

use std::mem::size_of;

/// Mirrors `struct perf_event_attr` from `linux/perf_event.h`, stable prefix only.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}

impl Default for perf_event_attr {
    fn default() -> Self {
        // zeroed is a valid bit pattern for every field above
        unsafe { std::mem::zeroed() }
    }
}

impl perf_event_attr {
    pub fn attr_size() -> u32 {
        size_of::<Self>() as u32
    }
}

// PERF_TYPE_*
pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;

// PERF_COUNT_HW_*
pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;

// PERF_COUNT_SW_*
pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;

// read_format bits
pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
pub const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;

// perf_event_attr.flags bit offsets (bitfield in the C struct)
pub const ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const ATTR_FLAG_INHERIT: u64 = 1 << 1;

// ioctl opcodes, see linux/perf_event.h's _IO/_IOW encodings
pub const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
pub const PERF_EVENT_IOC_RESET: u64 = 0x2403;

pub const PERF_IOC_FLAG_GROUP: u64 = 1;
