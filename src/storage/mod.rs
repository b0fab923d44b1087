pub mod cardinality;
pub mod clock;
pub mod engine;
pub mod memory;
pub mod store;

pub use cardinality::{Admission, CardinalityLimiter, OVERFLOW_ATTRIBUTE};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{MemoryStore, StoreConfig};
pub use memory::{EstimateSize, MemoryStats, MemoryTracker};
pub use store::{
    ExpiryStats, MetricSummary, StorageError, StoreStats, TelemetryStore, WriteSummary,
};
