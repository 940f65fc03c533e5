//! # Core Infrastructure Module
//!
//! Device contexts, pooled device memory, the frame data model and the bounded queues
//! that connect pipeline stages, plus the counters every stage reports into.

pub mod buffer_pool;
pub mod device;
pub mod frame;
pub mod metrics;
pub mod stage_queue;
