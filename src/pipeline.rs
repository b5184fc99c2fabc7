//! Detection pipeline
//!
//! Runs one request end to end: probe the device, size the image, time the
//! detector, sample health metrics, append one log row and render the result.
//!
//! # Concurrency
//!
//! Detector calls are serialized behind a mutex that also covers the
//! peak-memory reset and read, so timings and peaks from concurrent requests
//! never mix. The log sink serializes its own writes. There is no timeout on
//! the detector call: a hung detector blocks its request and every request
//! queued behind it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Local;
use image::{DynamicImage, GenericImageView};
use thiserror::Error;
use uuid::Uuid;

use crate::imaging::{resize_max_side, SizePolicy, SIZE_POLICY};
use crate::inference::{run_timed, Detections, Detector, DetectorError};
use crate::round_to;
use crate::storage::{LogFailurePolicy, PerfLog, PipelineSettings, RecordSink, StorageError};
use crate::system::{capacity_mb, host_memory, Device, MetricsSampler};
use crate::types::record::LogRecord;

/// Errors surfaced to the caller of [`DetectionPipeline::detect`]
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No image (or an empty one) was supplied
    #[error("Please upload an image.")]
    MissingImage,

    /// The detector failed; passed through as-is
    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error("Failed to write performance log: {0}")]
    Log(#[from] StorageError),
}

impl PipelineError {
    /// True for errors caused by the request itself rather than the system
    pub fn is_user_error(&self) -> bool {
        matches!(self, PipelineError::MissingImage)
    }
}

/// Everything one request produced
#[derive(Debug, Clone)]
pub struct DetectionOutput {
    /// Annotated copy of the (possibly downsized) input
    pub image: DynamicImage,
    pub detections: Detections,
    /// The row handed to the log sink
    pub record: LogRecord,
    /// False only when the write failed under [`LogFailurePolicy::Warn`]
    pub logged: bool,
}

/// Per-request orchestrator over a shared detector and log
pub struct DetectionPipeline {
    device: Device,
    detector: Mutex<Box<dyn Detector>>,
    model_name: String,
    sampler: MetricsSampler,
    sink: Arc<dyn RecordSink>,
    policy: &'static SizePolicy,
    log_failure_policy: LogFailurePolicy,
}

impl DetectionPipeline {
    /// Assemble a pipeline from its collaborators
    ///
    /// Accelerator presence is fixed by `device` for the pipeline's lifetime.
    pub fn new(
        device: Device,
        detector: Box<dyn Detector>,
        sampler: MetricsSampler,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let model_name = detector.model_name().to_string();
        Self {
            device,
            detector: Mutex::new(detector),
            model_name,
            sampler,
            sink,
            policy: &SIZE_POLICY,
            log_failure_policy: LogFailurePolicy::default(),
        }
    }

    /// Pipeline on the auto-selected device, NVML telemetry and the CSV log
    pub fn from_settings(settings: &PipelineSettings, detector: Box<dyn Detector>) -> Self {
        let device = if settings.force_cpu {
            tracing::info!("Accelerator disabled by settings, running on CPU");
            Device::Cpu
        } else {
            Device::auto()
        };
        let sink = Arc::new(PerfLog::new(&settings.log_path));

        tracing::info!(
            "Pipeline ready: device={}, model={}, mode={}, log={}",
            device.kind(),
            detector.model_name(),
            settings.mode,
            settings.log_path.display()
        );

        Self::new(device, detector, MetricsSampler::nvml(), sink)
            .with_log_failure_policy(settings.log_failure_policy)
    }

    pub fn with_log_failure_policy(mut self, policy: LogFailurePolicy) -> Self {
        self.log_failure_policy = policy;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Detect objects and return the annotated image
    pub fn detect(&self, image: Option<DynamicImage>) -> Result<DynamicImage, PipelineError> {
        self.run(image).map(|output| output.image)
    }

    /// Full request: the annotated image plus what was measured and logged
    pub fn run(&self, image: Option<DynamicImage>) -> Result<DetectionOutput, PipelineError> {
        let span = tracing::info_span!("detect", request_id = %Uuid::new_v4());
        let _enter = span.enter();

        let image = match image {
            Some(image) if image.width() > 0 && image.height() > 0 => image,
            _ => {
                tracing::info!("Rejected request without an image");
                return Err(PipelineError::MissingImage);
            }
        };

        let capacity = capacity_mb(&self.device);
        let max_side = self.policy.max_side(capacity);
        let (orig_w, orig_h) = image.dimensions();
        let image = resize_max_side(image, max_side);
        let (width, height) = image.dimensions();
        tracing::debug!(
            "Capacity {:?} MB -> max side {}, input {}x{} -> {}x{}",
            capacity,
            max_side,
            orig_w,
            orig_h,
            width,
            height
        );

        let ram = host_memory();

        let timed = {
            let mut detector = self.lock_detector();
            run_timed(&self.device, || detector.infer(&image))?
        };

        let metrics = self.sampler.sample();

        let mut record = LogRecord::new()
            .with("timestamp", Local::now().format("%Y-%m-%dT%H:%M:%S").to_string())
            .with("device", self.device.kind().as_str())
            .with("model", self.model_name.as_str())
            .with("infer_ms", timed.infer_ms)
            .with("vram_peak_mb", timed.vram_peak_mb)
            .with("ram_used_mb", round_to(ram.used_mb, 1))
            .with("ram_total_mb", round_to(ram.total_mb, 1));
        record.extend(metrics.fields());

        let logged = self.append_log(&record)?;

        let detections = timed.output;
        let rendered = self.lock_detector().render(&image, &detections);

        tracing::info!(
            "Detected {} object(s) in {:.2} ms on {}",
            detections.len(),
            timed.infer_ms,
            self.device.kind()
        );

        Ok(DetectionOutput {
            image: rendered,
            detections,
            record,
            logged,
        })
    }

    fn append_log(&self, record: &LogRecord) -> Result<bool, PipelineError> {
        match self.sink.append(record) {
            Ok(()) => Ok(true),
            Err(e) => match self.log_failure_policy {
                LogFailurePolicy::Propagate => Err(PipelineError::Log(e)),
                LogFailurePolicy::Warn => {
                    tracing::error!("Failed to write performance log, continuing: {}", e);
                    Ok(false)
                }
            },
        }
    }

    fn lock_detector(&self) -> MutexGuard<'_, Box<dyn Detector>> {
        self.detector.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::Detection;
    use crate::system::Accelerator;
    use crate::types::record::LogValue;
    use image::RgbImage;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    const COLUMNS: [&str; 12] = [
        "timestamp",
        "device",
        "model",
        "infer_ms",
        "vram_peak_mb",
        "ram_used_mb",
        "ram_total_mb",
        "gpu_name",
        "gpu_load_pct",
        "gpu_temp_c",
        "gpu_mem_used_mb",
        "gpu_mem_total_mb",
    ];

    #[derive(Clone, Default)]
    struct FakeDetector {
        seen: Arc<Mutex<Vec<(u32, u32)>>>,
        in_flight: Arc<AtomicBool>,
        fail: bool,
        delay: Option<Duration>,
    }

    impl Detector for FakeDetector {
        fn model_name(&self) -> &str {
            "fake-yolo"
        }

        fn infer(&mut self, image: &DynamicImage) -> Result<Detections, DetectorError> {
            assert!(
                !self.in_flight.swap(true, Ordering::SeqCst),
                "detector entered concurrently"
            );
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            self.seen.lock().unwrap().push(image.dimensions());
            self.in_flight.store(false, Ordering::SeqCst);

            if self.fail {
                return Err(DetectorError::Inference("weights corrupted".to_string()));
            }
            Ok(Detections {
                detections: vec![Detection {
                    bbox_xyxy: [1.0, 1.0, 10.0, 10.0],
                    score: 0.9,
                    class_id: 0,
                    label: Some("person".to_string()),
                }],
            })
        }
    }

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<LogRecord>>,
        fail: bool,
    }

    impl RecordSink for MemorySink {
        fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
            if self.fail {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct FakeAccelerator {
        total_mb: u64,
    }

    impl Accelerator for FakeAccelerator {
        fn name(&self) -> String {
            "Fake GPU".to_string()
        }
        fn total_memory_bytes(&self) -> Option<u64> {
            Some(self.total_mb * 1024 * 1024)
        }
        fn reset_peak_memory_stats(&self) {}
        fn synchronize(&self) {}
        fn max_memory_allocated_bytes(&self) -> Option<u64> {
            Some(256 * 1024 * 1024)
        }
    }

    fn image(width: u32, height: u32) -> Option<DynamicImage> {
        Some(DynamicImage::ImageRgb8(RgbImage::new(width, height)))
    }

    fn memory_pipeline(device: Device, detector: FakeDetector) -> (DetectionPipeline, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let pipeline = DetectionPipeline::new(
            device,
            Box::new(detector),
            MetricsSampler::disabled(),
            sink.clone(),
        );
        (pipeline, sink)
    }

    fn read_log(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn test_two_cpu_requests_append_two_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("perf_log.csv");
        let pipeline = DetectionPipeline::new(
            Device::Cpu,
            Box::new(FakeDetector::default()),
            MetricsSampler::disabled(),
            Arc::new(PerfLog::new(&path)),
        );

        pipeline.detect(image(320, 240)).unwrap();
        pipeline.detect(image(320, 240)).unwrap();

        let rows = read_log(&path);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], COLUMNS);
        for row in &rows[1..] {
            assert_eq!(row[1], "cpu");
            assert_eq!(row[2], "fake-yolo");
            let infer_ms: f64 = row[3].parse().unwrap();
            assert!(infer_ms >= 0.0);
            assert_eq!(row[4], "");
            assert!(row[7..].iter().all(String::is_empty));
        }
    }

    #[test]
    fn test_missing_image_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("perf_log.csv");
        let detector = FakeDetector::default();
        let pipeline = DetectionPipeline::new(
            Device::Cpu,
            Box::new(detector.clone()),
            MetricsSampler::disabled(),
            Arc::new(PerfLog::new(&path)),
        );

        let err = pipeline.detect(None).unwrap_err();
        assert!(matches!(err, PipelineError::MissingImage));
        assert!(err.is_user_error());
        assert_eq!(err.to_string(), "Please upload an image.");

        let err = pipeline.detect(Some(DynamicImage::new_rgb8(0, 0))).unwrap_err();
        assert!(matches!(err, PipelineError::MissingImage));

        assert!(!path.exists());
        assert!(detector.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_detector_failure_propagates_without_row() {
        let detector = FakeDetector {
            fail: true,
            ..Default::default()
        };
        let (pipeline, sink) = memory_pipeline(Device::Cpu, detector);

        let err = pipeline.detect(image(100, 100)).unwrap_err();
        assert!(matches!(err, PipelineError::Detector(DetectorError::Inference(_))));
        assert_eq!(err.to_string(), "Inference failed: weights corrupted");
        assert!(!err.is_user_error());
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_accelerator_limits_to_640() {
        let detector = FakeDetector::default();
        let (pipeline, _sink) = memory_pipeline(Device::Cpu, detector.clone());

        pipeline.detect(image(3000, 1000)).unwrap();
        assert_eq!(*detector.seen.lock().unwrap(), [(640, 213)]);
    }

    #[test]
    fn test_capacity_selects_max_side() {
        let detector = FakeDetector::default();
        let device = Device::Accelerator(Arc::new(FakeAccelerator { total_mb: 5000 }));
        let (pipeline, sink) = memory_pipeline(device, detector.clone());

        let output = pipeline.run(image(2000, 1000)).unwrap();
        pipeline.run(image(500, 300)).unwrap();

        assert_eq!(*detector.seen.lock().unwrap(), [(960, 480), (500, 300)]);
        assert_eq!(output.image.dimensions(), (960, 480));
        assert_eq!(output.detections.len(), 1);
        assert!(output.logged);

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("device"), Some(&LogValue::from("cuda")));
        assert_eq!(records[0].get("vram_peak_mb"), Some(&LogValue::Float(256.0)));
    }

    #[test]
    fn test_record_columns_in_order() {
        let (pipeline, _sink) = memory_pipeline(Device::Cpu, FakeDetector::default());

        let output = pipeline.run(image(64, 64)).unwrap();
        let keys: Vec<_> = output.record.keys().collect();
        assert_eq!(keys, COLUMNS);
        assert_eq!(output.record.get("vram_peak_mb"), Some(&LogValue::Absent));
        assert_eq!(output.record.get("model"), Some(&LogValue::from("fake-yolo")));
    }

    #[test]
    fn test_log_failure_propagates_by_default() {
        let sink = Arc::new(MemorySink {
            fail: true,
            ..Default::default()
        });
        let pipeline = DetectionPipeline::new(
            Device::Cpu,
            Box::new(FakeDetector::default()),
            MetricsSampler::disabled(),
            sink,
        );

        let err = pipeline.detect(image(64, 64)).unwrap_err();
        assert!(matches!(err, PipelineError::Log(_)));
    }

    #[test]
    fn test_log_failure_can_be_tolerated() {
        let sink = Arc::new(MemorySink {
            fail: true,
            ..Default::default()
        });
        let pipeline = DetectionPipeline::new(
            Device::Cpu,
            Box::new(FakeDetector::default()),
            MetricsSampler::disabled(),
            sink,
        )
        .with_log_failure_policy(LogFailurePolicy::Warn);

        let output = pipeline.run(image(64, 64)).unwrap();
        assert!(!output.logged);
        assert_eq!(output.image.dimensions(), (64, 64));
    }

    #[test]
    fn test_concurrent_requests_are_serialized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("perf_log.csv");
        let detector = FakeDetector {
            delay: Some(Duration::from_millis(2)),
            ..Default::default()
        };
        let pipeline = Arc::new(DetectionPipeline::new(
            Device::Cpu,
            Box::new(detector.clone()),
            MetricsSampler::disabled(),
            Arc::new(PerfLog::new(&path)),
        ));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                thread::spawn(move || {
                    for _ in 0..4 {
                        pipeline.detect(image(800, 600)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(detector.seen.lock().unwrap().len(), 24);
        let rows = read_log(&path);
        assert_eq!(rows.len(), 25);
        assert_eq!(rows[0], COLUMNS);
    }
}
