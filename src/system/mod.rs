//! Host and accelerator probing
//!
//! Reads device capacity, host memory and accelerator health.

pub mod gpu;
pub mod resources;
pub mod telemetry;

pub use gpu::{capacity_mb, Accelerator, Device, DeviceKind, NvmlAccelerator};
pub use resources::{host_memory, HostMemory};
pub use telemetry::{DeviceReading, GpuMetrics, MetricsSampler, TelemetryError, TelemetrySource};
