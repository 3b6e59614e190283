//! # Courier Delivery
//!
//! 持久化投递队列与后台投递工作者。

pub mod backoff;
pub mod clock;
pub mod item;
pub mod queue;
pub mod store;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use item::{Failure, ItemId, ItemState, Priority, QueueItem};
pub use queue::{
    DeliveryQueue, FailOutcome, QueueEvent, QueueSnapshot, QueueState, RecoveryReport,
};
pub use worker::{DeliveryWorker, WorkerStats};
