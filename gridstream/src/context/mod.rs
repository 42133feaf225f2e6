//! Execution contexts handed to stages and query tasks.
//!
//! - [`StreamerContext`]: one per pipeline instance; windows, local space and
//!   cluster query helpers
//! - [`StageContext`]: one per running batch; adds the next stage name and the
//!   batch's cancellation state

mod stage;
mod streamer;

pub use stage::StageContext;
pub use streamer::StreamerContext;
