//! GPU detection and management
//!
//! Decides once at startup whether inference runs on an accelerator and
//! exposes the device operations the timing wrapper needs.

use std::fmt;
use std::sync::Arc;

use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;
use once_cell::sync::OnceCell;

/// Bytes per megabyte as used in every memory column (MiB).
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

static NVML: OnceCell<Option<Nvml>> = OnceCell::new();

/// Shared NVML handle, initialized on first use.
///
/// Returns `None` when the NVIDIA management library is not installed or
/// fails to initialize. The outcome is cached for the process lifetime.
pub fn nvml() -> Option<&'static Nvml> {
    NVML.get_or_init(|| match Nvml::init() {
        Ok(nvml) => Some(nvml),
        Err(e) => {
            tracing::debug!("NVML unavailable: {}", e);
            None
        }
    })
    .as_ref()
}

/// Device-side operations of an accelerator runtime.
///
/// Every method is infallible from the caller's point of view: a reading
/// that cannot be taken is reported as `None`.
pub trait Accelerator: Send + Sync {
    /// Human-readable device name
    fn name(&self) -> String;

    /// Total addressable device memory in bytes, read fresh on every call
    fn total_memory_bytes(&self) -> Option<u64>;

    /// Reset peak-memory accounting before a measured call
    fn reset_peak_memory_stats(&self);

    /// Block until all queued device work has drained
    fn synchronize(&self);

    /// Peak device memory since the last reset, in bytes
    fn max_memory_allocated_bytes(&self) -> Option<u64>;
}

/// Kind of device inference runs on, as written to the `device` column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution device selected for the lifetime of a pipeline
#[derive(Clone)]
pub enum Device {
    /// Host-only execution
    Cpu,
    /// Accelerator-backed execution
    Accelerator(Arc<dyn Accelerator>),
}

impl Device {
    /// Select the accelerator if one is present, else the host.
    pub fn auto() -> Self {
        match NvmlAccelerator::first() {
            Some(accel) => {
                tracing::info!("Using accelerator: {}", accel.name());
                Device::Accelerator(Arc::new(accel))
            }
            None => {
                tracing::info!("No accelerator found, running on CPU");
                Device::Cpu
            }
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Cpu => DeviceKind::Cpu,
            Device::Accelerator(_) => DeviceKind::Cuda,
        }
    }

    pub fn has_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }

    pub fn accelerator(&self) -> Option<&dyn Accelerator> {
        match self {
            Device::Cpu => None,
            Device::Accelerator(accel) => Some(accel.as_ref()),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("Device::Cpu"),
            Device::Accelerator(accel) => write!(f, "Device::Accelerator({})", accel.name()),
        }
    }
}

/// Accelerator memory capacity in megabytes
///
/// Returns `None` when running host-only or when the device does not report
/// its capacity. Never cached: a shared device can change between requests.
pub fn capacity_mb(device: &Device) -> Option<f64> {
    device
        .accelerator()?
        .total_memory_bytes()
        .map(|bytes| bytes as f64 / BYTES_PER_MB)
}

/// Accelerator backed by the NVIDIA management library
///
/// NVML has no allocator high-water mark and no stream synchronization.
/// `synchronize` is a no-op and the peak reading is this process's device
/// memory footprint once the measured call has returned.
pub struct NvmlAccelerator {
    nvml: &'static Nvml,
    index: u32,
}

impl NvmlAccelerator {
    /// The first enumerated NVIDIA device, if any
    pub fn first() -> Option<Self> {
        let nvml = nvml()?;
        match nvml.device_count() {
            Ok(0) => None,
            Ok(_) => Some(Self { nvml, index: 0 }),
            Err(e) => {
                tracing::debug!("NVML device enumeration failed: {}", e);
                None
            }
        }
    }

    fn process_memory_bytes(&self) -> Option<u64> {
        let device = self.nvml.device_by_index(self.index).ok()?;
        let pid = std::process::id();
        device
            .running_compute_processes()
            .ok()?
            .into_iter()
            .find(|p| p.pid == pid)
            .and_then(|p| match p.used_gpu_memory {
                UsedGpuMemory::Used(bytes) => Some(bytes),
                UsedGpuMemory::Unavailable => None,
            })
    }
}

impl Accelerator for NvmlAccelerator {
    fn name(&self) -> String {
        self.nvml
            .device_by_index(self.index)
            .and_then(|d| d.name())
            .unwrap_or_else(|_| format!("GPU {}", self.index))
    }

    fn total_memory_bytes(&self) -> Option<u64> {
        let device = self.nvml.device_by_index(self.index).ok()?;
        device.memory_info().ok().map(|m| m.total)
    }

    fn reset_peak_memory_stats(&self) {}

    fn synchronize(&self) {}

    fn max_memory_allocated_bytes(&self) -> Option<u64> {
        self.process_memory_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAccelerator(Option<u64>);

    impl Accelerator for FixedAccelerator {
        fn name(&self) -> String {
            "Fixed".to_string()
        }
        fn total_memory_bytes(&self) -> Option<u64> {
            self.0
        }
        fn reset_peak_memory_stats(&self) {}
        fn synchronize(&self) {}
        fn max_memory_allocated_bytes(&self) -> Option<u64> {
            None
        }
    }

    #[test]
    fn test_cpu_has_no_capacity() {
        assert_eq!(capacity_mb(&Device::Cpu), None);
        assert!(!Device::Cpu.has_accelerator());
        assert_eq!(Device::Cpu.kind().as_str(), "cpu");
    }

    #[test]
    fn test_capacity_in_megabytes() {
        let device = Device::Accelerator(Arc::new(FixedAccelerator(Some(6 * 1024 * 1024 * 1024))));
        assert_eq!(capacity_mb(&device), Some(6144.0));
        assert_eq!(device.kind(), DeviceKind::Cuda);
        assert_eq!(device.kind().to_string(), "cuda");
    }

    #[test]
    fn test_unreadable_capacity_is_absent() {
        let device = Device::Accelerator(Arc::new(FixedAccelerator(None)));
        assert!(device.has_accelerator());
        assert_eq!(capacity_mb(&device), None);
    }
}
