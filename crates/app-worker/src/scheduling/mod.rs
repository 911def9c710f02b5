//! Backpressure-bounded schedulers.
//!
//! - [`async_chain`] - ordered execution with a backpressure counter
//! - [`fetch_manager`] - admission-controlled fetch dispatch built on the chain
//! - [`mid_task_scheduler`] - two-tier mutual exclusion between request tasks
//!   and cluster maintenance work

pub mod async_chain;
pub mod fetch_manager;
pub mod mid_task_scheduler;

pub use async_chain::{AsyncChain, ChainError};
pub use fetch_manager::{build_fetch_manager_builder, FetchManager, FetchManagerBuilder};
pub use mid_task_scheduler::{MidTaskScheduler, SchedulerCounts};
