//! Cooperative cancellation of batch workers.

mod token;

pub use token::{CancelCallback, CancellationToken};
