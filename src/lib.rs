//! Storage and query core of the Rye relational database.
//!
//! Four cooperating subsystems:
//!
//! - [`volume`] owns the on-disk layout of every data volume: the header,
//!   the sector and page allocation bitmaps, allocation and (deferred)
//!   deallocation, expansion, and recovery replay.
//! - [`cache`] and [`router`] route allocation requests: a process-wide
//!   cache of free-space hints, partitioned by storage purpose, and the
//!   policy that picks a target volume and grows the database when space
//!   runs low.
//! - [`eval`] evaluates predicate trees over value descriptors with
//!   three-valued logic plus an explicit error state.
//! - [`plan`] holds the query-plan node graph, the restorer that
//!   rehydrates a packed plan stream into a live graph, and its packing
//!   counterpart.
//!
//! The transaction log, the SQL front end, and the broker are external
//! collaborators reached through the narrow interfaces in [`wal`].

pub mod cache;
pub mod error;
pub mod eval;
pub mod pgbuf;
pub mod plan;
pub mod router;
pub mod types;
pub mod value;
pub mod volume;
pub mod wal;

pub use error::{PlanError, StorageError};
pub use types::{PageId, Purpose, SectId, SysParams, VolId, Vpid};
pub use value::DbValue;
