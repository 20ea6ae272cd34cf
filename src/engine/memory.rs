//! Host memory checks consulted by the VU pool before it grows.

use sysinfo::System;

/// Rough per-VU cost: default thread stack plus a blocking HTTP client.
pub const PER_VU_BYTES: u64 = 2 * 1024 * 1024 + 256 * 1024;

/// Usage at which scale-up is held back for a tick.
pub const WARN_USAGE: f64 = 0.85;

/// Usage at which the pool refuses to grow and reports a resource error.
pub const CRITICAL_USAGE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub available_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryInfo {
    pub fn current() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            available_bytes: sys.available_memory(),
            total_bytes: sys.total_memory(),
        }
    }

    /// Fraction of total memory in use, 0.0 when the total is unknown.
    pub fn usage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 / self.total_bytes as f64
    }

    /// VUs that would still fit in available memory.
    pub fn headroom_vus(&self, per_vu: u64) -> usize {
        (self.available_bytes / per_vu.max(1)) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pressure {
    Normal,
    /// Above the warning line; defer growth.
    High(f64),
    /// Above the critical line; growth is an error.
    Critical(f64),
}

pub fn classify(info: &MemoryInfo) -> Pressure {
    let usage = info.usage();
    if usage >= CRITICAL_USAGE {
        Pressure::Critical(usage)
    } else if usage >= WARN_USAGE {
        Pressure::High(usage)
    } else {
        Pressure::Normal
    }
}

/// Source of memory readings; swapped out in tests.
pub trait MemoryProbe: Send + Sync {
    fn read(&self) -> MemoryInfo;
}

pub struct SystemProbe;

impl MemoryProbe for SystemProbe {
    fn read(&self) -> MemoryInfo {
        MemoryInfo::current()
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
