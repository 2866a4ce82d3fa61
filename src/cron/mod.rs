//! Scheduled jobs
//!
//! Jobs live in memory only. Each run is admitted through the `cron` lane.

pub mod schedule;
pub mod service;
pub mod types;

pub use schedule::{compute_next_run, parse_expr};
pub use service::{CronExecutor, CronService};
pub use types::{CronJob, CronJobCreate, CronJobState, CronSchedule, RunStatus};
