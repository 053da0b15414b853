//! Last-known-good server responses for offline reads.
//!
//! This cache exists for availability, not latency:
//! - one record per read endpoint, overwritten on every successful fetch
//! - no expiry and no eviction
//! - consulted only when the network read fails

mod layer;
mod result;

pub use layer::{CacheRecord, ResponseCache};
pub use result::{CacheResult, CacheSource};
