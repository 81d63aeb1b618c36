//! Live-broadcast watch sessions.

mod watch_model;
mod watch_tracker;

pub use watch_model::*;
pub use watch_tracker::*;
