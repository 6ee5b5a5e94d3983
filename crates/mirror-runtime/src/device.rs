//! Static device capabilities handed over by device enumeration
//!
//! Launch planning never queries a device itself: it receives a
//! [`CapabilityDescriptor`] obtained once from a runtime (or built by hand in
//! tests), which keeps the planner free of side effects.

use crate::error::{MirrorError, Result};
use std::fmt;

/// Per-device limits a launch geometry has to respect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityDescriptor {
    /// Maximum resident threads on one execution unit (multiprocessor)
    pub max_threads_per_unit: u32,
    /// Number of execution units on the device
    pub unit_count: u32,
    /// Maximum threads in one group (block)
    pub max_threads_per_group: u32,
}

impl CapabilityDescriptor {
    /// Create a descriptor; see [`validate`](Self::validate) for the accepted range
    pub const fn new(max_threads_per_unit: u32, unit_count: u32, max_threads_per_group: u32) -> Self {
        Self {
            max_threads_per_unit,
            unit_count,
            max_threads_per_group,
        }
    }

    /// Check that every limit is positive
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("max_threads_per_unit", self.max_threads_per_unit),
            ("unit_count", self.unit_count),
            ("max_threads_per_group", self.max_threads_per_group),
        ];
        match fields.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(MirrorError::invalid_argument(format!(
                "capability field {name} must be positive"
            ))),
            None => Ok(()),
        }
    }

    /// Threads the whole device can keep resident at once
    pub const fn max_concurrent_threads(&self) -> u64 {
        self.max_threads_per_unit as u64 * self.unit_count as u64
    }
}

impl fmt::Display for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} units x {} threads (max {} per group, {} concurrent)",
            self.unit_count,
            self.max_threads_per_unit,
            self.max_threads_per_group,
            self.max_concurrent_threads()
        )
    }
}

/// What device enumeration reports for one accelerator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub capability: CapabilityDescriptor,
    /// Kernels on this device are killed after a watchdog timeout, which is
    /// the case for accelerators that also drive a display
    pub kernel_exec_timeout: bool,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, capability: CapabilityDescriptor, kernel_exec_timeout: bool) -> Self {
        Self {
            name: name.into(),
            capability,
            kernel_exec_timeout,
        }
    }
}

/// Pick the device compute work should run on
///
/// Returns the first device without a kernel execution timeout, falling back
/// to device 0. `None` only when there are no devices.
pub fn preferred_device(devices: &[DeviceInfo]) -> Option<usize> {
    if devices.is_empty() {
        return None;
    }
    Some(devices.iter().position(|d| !d.kernel_exec_timeout).unwrap_or(0))
}
