//! Admission control for `PREPARED → RUNNING`.
//!
//! A start is admitted when the configured heap of the candidate fits in
//! what RUNNING services leave of the node budget (`used + requested <
//! max_memory`) and system CPU usage is below the threshold. The check
//! reserves nothing: two concurrent starts may both pass.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use sysinfo::System;

/// Source of the current system-wide CPU usage, in percent.
pub trait CpuProbe: Send + Sync + 'static {
    fn cpu_usage(&self) -> f32;
}

/// Samples the host with sysinfo. The first sample after construction
/// may read 0.
pub struct SystemCpuProbe {
    system: Mutex<System>,
}

impl SystemCpuProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemCpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProbe for SystemCpuProbe {
    fn cpu_usage(&self) -> f32 {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.global_cpu_usage()
    }
}

/// Fixed reading, adjustable at runtime.
#[derive(Debug, Default)]
pub struct StaticCpuProbe {
    bits: AtomicU32,
}

impl StaticCpuProbe {
    pub fn new(usage: f32) -> Self {
        Self {
            bits: AtomicU32::new(usage.to_bits()),
        }
    }

    pub fn set(&self, usage: f32) {
        self.bits.store(usage.to_bits(), Ordering::Relaxed);
    }
}

impl CpuProbe for StaticCpuProbe {
    fn cpu_usage(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Why a start was not admitted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdmissionDenial {
    /// Megabytes.
    Memory { used: u64, requested: u64, limit: u64 },
    /// Percent.
    Cpu { usage: f32, limit: f32 },
}

impl fmt::Display for AdmissionDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory {
                used,
                requested,
                limit,
            } => write!(
                f,
                "not enough memory: {used} MB in use + {requested} MB requested, limit {limit} MB"
            ),
            Self::Cpu { usage, limit } => {
                write!(f, "cpu usage too high: {usage:.1}% (limit {limit:.1}%)")
            }
        }
    }
}

pub struct AdmissionControl {
    max_memory: u64,
    max_cpu_usage: f32,
    cpu: Arc<dyn CpuProbe>,
}

impl AdmissionControl {
    pub fn new(max_memory: u64, max_cpu_usage: f32, cpu: Arc<dyn CpuProbe>) -> Self {
        Self {
            max_memory,
            max_cpu_usage,
            cpu,
        }
    }

    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    /// Check a candidate needing `requested` MB while `used` MB are held
    /// by RUNNING services.
    pub fn check(&self, used: u64, requested: u64) -> Result<(), AdmissionDenial> {
        if used.saturating_add(requested) >= self.max_memory {
            return Err(AdmissionDenial::Memory {
                used,
                requested,
                limit: self.max_memory,
            });
        }

        let usage = self.cpu.cpu_usage();
        if usage >= self.max_cpu_usage {
            return Err(AdmissionDenial::Cpu {
                usage,
                limit: self.max_cpu_usage,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(max_memory: u64, cpu: f32) -> AdmissionControl {
        AdmissionControl::new(max_memory, 90.0, Arc::new(StaticCpuProbe::new(cpu)))
    }

    #[test]
    fn admits_when_budget_strictly_fits() {
        let admission = control(1024, 10.0);
        assert_eq!(admission.check(900, 99), Ok(()));
        assert_eq!(admission.check(0, 1023), Ok(()));
    }

    #[test]
    fn rejects_when_budget_exceeded() {
        let admission = control(1024, 10.0);
        assert_eq!(
            admission.check(900, 150),
            Err(AdmissionDenial::Memory {
                used: 900,
                requested: 150,
                limit: 1024
            })
        );
    }

    #[test]
    fn exact_budget_is_rejected() {
        let admission = control(1024, 10.0);
        assert!(admission.check(900, 124).is_err());
        assert!(admission.check(0, 1024).is_err());
    }

    #[test]
    fn cpu_threshold_is_exclusive() {
        let probe = Arc::new(StaticCpuProbe::new(89.9));
        let admission = AdmissionControl::new(1024, 90.0, probe.clone());
        assert!(admission.check(0, 1).is_ok());

        probe.set(90.0);
        assert!(matches!(admission.check(0, 1), Err(AdmissionDenial::Cpu { .. })));
    }

    #[test]
    fn memory_is_checked_before_cpu() {
        let admission = control(100, 99.0);
        assert!(matches!(admission.check(50, 60), Err(AdmissionDenial::Memory { .. })));
    }

    #[test]
    fn denial_messages_name_the_resource() {
        let mem = AdmissionDenial::Memory {
            used: 900,
            requested: 150,
            limit: 1024,
        };
        assert!(mem.to_string().contains("memory"));
        let cpu = AdmissionDenial::Cpu {
            usage: 95.0,
            limit: 90.0,
        };
        assert!(cpu.to_string().contains("cpu"));
    }

    #[test]
    fn system_probe_reads_a_percentage() {
        let probe = SystemCpuProbe::new();
        let usage = probe.cpu_usage();
        assert!((0.0..=100.0 * 1024.0).contains(&usage));
    }
}
