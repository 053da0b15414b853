//! Offline-first write and sync engine for school records.
//!
//! Teachers keep recording grades and defining assessment categories while
//! disconnected. Writes are stored durably, then replayed against the records
//! service once connectivity returns, with references to records created
//! offline rewritten to their server ids on the way.

pub mod app;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod error;
pub mod gate;
pub mod ident;
pub mod payload;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod store;
pub mod sync;

pub use app::App;
pub use error::{SyncError, SyncResult};
