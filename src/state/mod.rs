//! Persistent poll state.
//!
//! SQLite holds, per source, the items already settled (fetched or skipped),
//! the listing watermark, the Slack messages already logged and a history of
//! poll cycles. [`StateTracker`] is the in-memory view one poll loop owns;
//! [`SourceLock`] keeps a second process from owning the same view.

pub mod db;
pub mod error;
pub mod lock;
pub mod schema;
pub mod tracker;
pub mod types;

pub use db::{SqliteStateDb, StateDb};
pub use error::StateError;
pub use lock::SourceLock;
pub use tracker::StateTracker;
pub use types::{CycleStats, Watermark};
