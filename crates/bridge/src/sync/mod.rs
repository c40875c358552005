//! Resynchronization of the engine's cache from the store
//!
//! Safe to re-run: an unchanged store produces the same announcements.

mod resync;
mod timing;

pub use resync::{SyncStats, resync};
pub use timing::cooldown_elapsed;
