//! Prefix-cache slot management.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`input`]: Input elements (tokens and multimodal items) and their equality
//! - [`prefix`]: Common-prefix measurement between input sequences
//! - [`slot`]: CacheSlot records
//! - [`selector`]: Longest-match and best-match slot selection
//! - [`shift`]: Context shift sizing
//! - [`pool`]: Slot pool owning the slots and their lifecycle
//! - [`backend`]: Interface to the physical KV cache
//! - [`error`]: Errors reported by the pool

pub mod backend;
pub mod error;
pub mod input;
pub mod pool;
pub mod prefix;
pub mod selector;
pub mod shift;
pub mod slot;
