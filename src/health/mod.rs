//! Health checking for quarantined routes
//!
//! This module contains the time-keyed probe queue and the scheduler that
//! takes failed routes out of rotation and reinstates them after enough
//! consecutive successful TCP-connect probes.

pub mod queue;
pub mod scheduler;

pub use queue::{TaskItem, TaskQueue, INDEX_REMOVED, MIN_CAPACITY};
pub use scheduler::{HealthCheckScheduler, HealthSchedulerOptions};
