//! Accelerator health sampling
//!
//! Best-effort snapshot of the first accelerator's name, load, temperature
//! and memory. Missing telemetry degrades to absent fields, never to errors.

use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use thiserror::Error;

use crate::round_to;
use crate::system::gpu::{nvml, BYTES_PER_MB};
use crate::types::record::LogValue;

/// Errors raised by a telemetry source. They never leave the sampler.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Telemetry source unavailable: {0}")]
    Unavailable(String),
    #[error("Device query failed: {0}")]
    Query(String),
}

/// Raw per-device reading, each field independently optional
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceReading {
    pub name: Option<String>,
    /// Utilization in percent
    pub load_pct: Option<f64>,
    /// Temperature in the unit the source reports
    pub temperature: Option<u32>,
    pub memory_used_bytes: Option<u64>,
    pub memory_total_bytes: Option<u64>,
}

/// Something that can enumerate accelerators and read their health
pub trait TelemetrySource: Send + Sync {
    fn device_count(&self) -> Result<u32, TelemetryError>;
    fn read_device(&self, index: u32) -> Result<DeviceReading, TelemetryError>;
}

/// NVML-backed telemetry source
pub struct NvmlTelemetry {
    nvml: &'static Nvml,
}

impl NvmlTelemetry {
    /// Returns `None` when NVML is not installed on this host.
    pub fn new() -> Option<Self> {
        nvml().map(|nvml| Self { nvml })
    }
}

impl TelemetrySource for NvmlTelemetry {
    fn device_count(&self) -> Result<u32, TelemetryError> {
        self.nvml
            .device_count()
            .map_err(|e| TelemetryError::Query(e.to_string()))
    }

    fn read_device(&self, index: u32) -> Result<DeviceReading, TelemetryError> {
        let device = self
            .nvml
            .device_by_index(index)
            .map_err(|e| TelemetryError::Query(e.to_string()))?;

        let memory = device.memory_info().ok();

        Ok(DeviceReading {
            name: device.name().ok(),
            load_pct: device.utilization_rates().ok().map(|u| u.gpu as f64),
            temperature: device.temperature(TemperatureSensor::Gpu).ok(),
            memory_used_bytes: memory.as_ref().map(|m| m.used),
            memory_total_bytes: memory.as_ref().map(|m| m.total),
        })
    }
}

/// Point-in-time accelerator health snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuMetrics {
    pub gpu_name: Option<String>,
    /// Utilization in percent, one decimal
    pub gpu_load_pct: Option<f64>,
    pub gpu_temp_c: Option<u32>,
    /// Memory in MB, one decimal
    pub gpu_mem_used_mb: Option<f64>,
    pub gpu_mem_total_mb: Option<f64>,
}

impl GpuMetrics {
    /// True when no field could be observed
    pub fn is_empty(&self) -> bool {
        *self == GpuMetrics::default()
    }

    /// Log columns for this snapshot, in their fixed order
    pub fn fields(&self) -> Vec<(&'static str, LogValue)> {
        vec![
            ("gpu_name", self.gpu_name.clone().into()),
            ("gpu_load_pct", self.gpu_load_pct.into()),
            ("gpu_temp_c", self.gpu_temp_c.map(i64::from).into()),
            ("gpu_mem_used_mb", self.gpu_mem_used_mb.into()),
            ("gpu_mem_total_mb", self.gpu_mem_total_mb.into()),
        ]
    }
}

/// Samples the first enumerated accelerator.
///
/// Only device 0 is read when several are present.
pub struct MetricsSampler {
    source: Option<Box<dyn TelemetrySource>>,
}

impl MetricsSampler {
    pub fn new(source: Option<Box<dyn TelemetrySource>>) -> Self {
        Self { source }
    }

    /// Sampler over NVML, or an always-empty sampler if NVML is missing
    pub fn nvml() -> Self {
        Self::new(NvmlTelemetry::new().map(|s| Box::new(s) as Box<dyn TelemetrySource>))
    }

    /// Sampler that never observes anything
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn sample(&self) -> GpuMetrics {
        match self.try_sample() {
            Ok(metrics) => metrics,
            Err(e) => {
                tracing::debug!("GPU metrics unavailable: {}", e);
                GpuMetrics::default()
            }
        }
    }

    fn try_sample(&self) -> Result<GpuMetrics, TelemetryError> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| TelemetryError::Unavailable("no telemetry source".to_string()))?;

        if source.device_count()? == 0 {
            return Ok(GpuMetrics::default());
        }

        let reading = source.read_device(0)?;

        Ok(GpuMetrics {
            gpu_name: reading.name,
            gpu_load_pct: reading.load_pct.map(|p| round_to(p.clamp(0.0, 100.0), 1)),
            gpu_temp_c: reading.temperature,
            gpu_mem_used_mb: reading
                .memory_used_bytes
                .map(|b| round_to(b as f64 / BYTES_PER_MB, 1)),
            gpu_mem_total_mb: reading
                .memory_total_bytes
                .map(|b| round_to(b as f64 / BYTES_PER_MB, 1)),
        })
    }
}
