//! System resource monitoring
//!
//! Reads host RAM usage at the moment a request is served.

use sysinfo::System;

use crate::system::gpu::BYTES_PER_MB;

/// Host memory usage in megabytes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostMemory {
    pub used_mb: f64,
    pub total_mb: f64,
}

/// Sample current host memory usage
///
/// Used memory is `total - available`, so reclaimable caches count as free.
pub fn host_memory() -> HostMemory {
    let mut sys = System::new();
    sys.refresh_memory();

    let total = sys.total_memory();
    let used = total.saturating_sub(sys.available_memory());

    HostMemory {
        used_mb: used as f64 / BYTES_PER_MB,
        total_mb: total as f64 / BYTES_PER_MB,
    }
}
