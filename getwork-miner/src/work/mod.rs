//! Units of work and their subdivision into nonce ranges.
//!
//! The protocol client turns each coordinator response into an
//! [`AssignedWork`]. The [`WorkQueue`] keeps the most recent one and carves
//! its nonce space into [`WorkRange`]s for the prefetch queues, which in turn
//! hand them to compute threads.

mod job;
mod work_queue;

pub use job::{
    encode_result, meets_target, AssignedWork, WorkRange, DEFAULT_MASK, HEADER_LEN,
    RESULT_FRAME_LEN,
};
#[cfg(test)]
pub(crate) use job::genesis_work;
pub use work_queue::{WorkQueue, DEFAULT_RANGE_SIZE};
