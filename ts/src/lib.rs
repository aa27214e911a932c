//! TaskStore - generic persistent record storage
//!
//! Records are any serde type implementing [`Record`]. Each record is stored as
//! a JSON document in SQLite, with its indexed fields written to a separate
//! table so status-style queries stay cheap.

mod record;
mod store;

pub use record::{Filter, FilterOp, IndexValue, Record, now_ms};
pub use store::Store;
