pub mod ttl;

pub use ttl::{run_ttl_expiration, TtlWorker};
