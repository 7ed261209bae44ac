pub mod aggregate;
pub mod export;
pub mod history;
pub mod management;
pub mod netdata;
pub mod source;

pub use aggregate::{AttributionStatus, Collector, DayResult, NodeOutcome, RunSummary};
pub use management::ManagementClient;
pub use netdata::NetdataClient;
pub use source::{
    AttributionOutcome, AttributionSource, MemoryAttributionSource, MemoryMetricSource,
    MetricSource,
};
