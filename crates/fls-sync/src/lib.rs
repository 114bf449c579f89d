//! Sync engines: detect changed rows on the source database and append
//! canonical payload events to the destination outbox.

pub mod driver;
pub mod leave;

pub use driver::DriverSyncEngine;
pub use leave::LeaveSyncEngine;
