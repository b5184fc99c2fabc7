//! Timed inference
//!
//! Brackets a detector call with a monotonic timer and, on accelerators,
//! peak-memory accounting. The caller is responsible for serializing calls
//! against a shared device; concurrent calls would mix their readings.

use std::time::Instant;

use crate::round_to;
use crate::system::gpu::{Device, BYTES_PER_MB};

/// Output of a timed call
#[derive(Debug, Clone, PartialEq)]
pub struct Timed<T> {
    pub output: T,
    /// Wall-clock duration in milliseconds, two decimals
    pub infer_ms: f64,
    /// Peak accelerator memory in MB, one decimal; always `None` on the host
    pub vram_peak_mb: Option<f64>,
}

/// Run `call` under timing on `device`
///
/// On an accelerator the peak counter is reset and queued work drained
/// before the clock starts, and drained again before it stops. Errors from
/// `call` are returned untouched.
pub fn run_timed<T, E, F>(device: &Device, call: F) -> Result<Timed<T>, E>
where
    F: FnOnce() -> Result<T, E>,
{
    let accelerator = device.accelerator();

    if let Some(accel) = accelerator {
        accel.reset_peak_memory_stats();
        accel.synchronize();
    }

    let start = Instant::now();
    let output = call()?;

    if let Some(accel) = accelerator {
        accel.synchronize();
    }
    let elapsed = start.elapsed();

    let vram_peak_mb = accelerator
        .and_then(|accel| accel.max_memory_allocated_bytes())
        .map(|bytes| round_to(bytes as f64 / BYTES_PER_MB, 1));

    Ok(Timed {
        output,
        infer_ms: round_to(elapsed.as_secs_f64() * 1000.0, 2),
        vram_peak_mb,
    })
}
