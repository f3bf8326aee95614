#![forbid(unsafe_code)]

mod guard;
mod queue;

pub use guard::{Guarded, StatusGuard, run_guarded};
pub use queue::{QueueConfig, QueueError, SqliteJobQueue};
