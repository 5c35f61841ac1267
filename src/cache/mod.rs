//! Session cache of page snapshots.
//!
//! - Entries are keyed by filter signature, page size and page number
//! - Stale entries stay readable so callers can serve them while revalidating
//! - Storage is pluggable: in memory by default, SQLite to survive restarts
//! - Late responses are fenced off by per-key request tickets

mod in_flight;
mod storage;
mod store;
mod traits;

pub use in_flight::{Claim, InFlightGuard, InFlightSet, InFlightWait};
pub use storage::{MemoryStorage, SnapshotStorage, SqliteStorage};
pub use store::{CacheStore, InvalidationListener, InvalidationScope, Ticket};
pub use traits::{CacheEntry, CacheSource, Clock, DatasetSnapshot, ManualClock, SystemClock};
