//! The `persistence` module keeps not-yet-acknowledged messages on disk.
//!
//! The journal is the recovery source of truth across restarts: everything
//! queued or in flight has a record in it, and a record is erased only when
//! its message is acknowledged.

pub mod log_store;

pub use log_store::MessageLog;
