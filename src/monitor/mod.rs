//! Performance monitoring: metric records, baselines, the recorder and
//! its reports, plus process resource sampling.

pub mod baseline;
pub mod record;
pub mod recorder;
pub mod report;
pub mod resources;

pub use baseline::{BaselineRegistry, PerformanceBaseline, MIN_BASELINE_SAMPLES};
pub use record::{MetricRecord, OperationKind, RecordStatus, ResourceReadings};
pub use recorder::{HealthStatus, MetricsRecorder, RecorderHealth, METRICS_TABLE};
pub use report::PerformanceReport;
pub use resources::{ProcessSampler, ResourceSample, ResourceSampler, ScriptedSampler};
