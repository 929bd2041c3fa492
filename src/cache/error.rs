use thiserror::Error;

use crate::cache::backend::BackendError;
use crate::cache::slot::SlotId;

#[derive(Error, Debug)]
pub enum SlotError {
    #[error("no available cache slots")]
    NoAvailableSlot,

    #[error("unknown cache slot {0}")]
    UnknownSlot(SlotId),

    #[error("cache slot {0} is already in use")]
    SlotInUse(SlotId),

    #[error("cache slot {0} is not in use")]
    SlotNotInUse(SlotId),

    #[error("cache slot {slot} would hold {len} inputs, capacity is {capacity}")]
    CapacityExceeded {
        slot: SlotId,
        len: usize,
        capacity: usize,
    },

    #[error("unable to shift context - keep exceeds context (keep: {keep} context: {capacity})")]
    KeepExceedsContext { keep: usize, capacity: usize },

    #[error("invalid slot pool configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}
