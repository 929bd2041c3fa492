//! Request scheduling on top of the slot pool.
//!
//! - [`engine`]: Per-request driver (load, prefill, decode, shift, release)
//! - [`workload`]: Workload file format for the replay binary

pub mod engine;
pub mod workload;
