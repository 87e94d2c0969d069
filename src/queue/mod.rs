//! The deferred work queue: metadata codec, runtime state, enqueue commit
//! protocol, and the capacity-aware dispatch loop.

pub mod dispatch;
pub mod enqueue;
pub mod metadata;
pub mod state;

pub use dispatch::{dispatch_queued_work, DispatchOverrides, MAX_DISPATCH_FAILURES};
pub use enqueue::{enqueue_bead, EnqueueOptions};
pub use metadata::QueueMetadata;
pub use state::QueueState;
