pub mod attribution;
pub mod config;
pub mod error;
pub mod gpu;
pub mod hardware;
pub mod telemetry;

pub use attribution::AttributionRecord;
pub use config::{CollectorConfig, DayWindow, ManagementConfig, NodeConfig, TimeConvention};
pub use error::{CollectError, Unit, UnitError};
pub use gpu::{
    gpu_label, mean, parse_gpu_label, DailyAverageRow, GpuDailyRecord, GpuIdentity, GpuMetrics,
    MetricPoint, RawSeries, UNUSED_USER,
};
pub use hardware::HardwareMap;
