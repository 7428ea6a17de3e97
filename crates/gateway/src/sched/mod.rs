//! Schedulers: deferred (one-shot with backoff) and recurring (cron-like),
//! both driven by a single armed timer per scheduler.

pub mod cron;
pub mod deferred;
pub mod model;
pub mod recurring;
pub mod store;
pub mod timeparse;

pub use deferred::{DeferredExecuteFn, DeferredScheduler};
pub use recurring::{RecurringExecuteFn, RecurringScheduler};
