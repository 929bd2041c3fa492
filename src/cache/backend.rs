//! Interface to the physical KV cache behind the slots.
//!
//! The slot pool only tracks which inputs each slot holds. Whatever owns
//! the actual tensors implements [`CacheBackend`] so the pool can ask it to
//! copy a prefix between slots or to drop a range of positions.

use thiserror::Error;

use crate::cache::slot::SlotId;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Operation not supported by cache backend: {0}")]
    Unsupported(String),

    #[error("Cache backend operation failed: {0}")]
    Failed(String),
}

/// Physical cache operations requested by the slot pool.
///
/// Calls happen while the pool lock is held and must not block.
pub trait CacheBackend: Send {
    /// Whether the cache for `slot` can continue from position `pos`.
    ///
    /// Backends that cannot resume mid-sequence (e.g. recurrent state that
    /// only exists at the end of the sequence) return `false` and the pool
    /// falls back to evaluating the whole prompt.
    fn can_resume(&self, _slot: SlotId, _pos: usize) -> bool {
        true
    }

    /// Copy the first `len` positions of `src` into `dst`.
    fn copy_prefix(&mut self, src: SlotId, dst: SlotId, len: usize) -> Result<(), BackendError>;

    /// Remove positions `begin..end` from `slot`, shifting later positions
    /// down. `end = None` removes everything from `begin` on.
    fn remove(&mut self, slot: SlotId, begin: usize, end: Option<usize>)
        -> Result<(), BackendError>;
}
