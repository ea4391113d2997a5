pub mod entry;
pub mod priority;

pub use entry::{DailyJobReservation, GlobalCounters, LeaseToken, LeasedEntry, QueueEntry, QueueEvent, UserCounters};
pub use priority::JobPriority;
