//! Balance sync: change feed, subscription lifecycle, and polling fallback.

mod change_feed;
mod registry;
mod sync_engine;
mod sync_model;
mod sync_scheduler;
mod sync_state;

pub use change_feed::*;
pub use registry::*;
pub use sync_engine::*;
pub use sync_model::*;
pub use sync_scheduler::*;
pub use sync_state::*;

#[cfg(test)]
mod tests;
