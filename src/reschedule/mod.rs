//! Permanent listener rescheduling
//!
//! - `plan`: the debounced plan mailbox
//! - `policy`: distribution policies and the modulo partition
//! - `remote`: bounded remote calls with retries
//! - `rescheduler`: the scheduler and its distribution algorithm
//! - `handler`: requests from other members

mod handler;
mod plan;
mod policy;
mod remote;
mod rescheduler;

pub use plan::{OfferEffect, PlanMailbox, ReschedulePlan};
pub use policy::{partition, partition_all, rank_members, ReschedulePolicy};
pub use remote::{call_with_retry, CallOutcome, RetryPolicy};
pub use rescheduler::{
    DistributionOutcome, LastRun, PermanentListenerRescheduler, RescheduleError,
    RescheduleStatus, ReschedulerState,
};
