//! # workcell-core
//!
//! Shared primitives for the workcell run orchestrator.
//!
//! This crate provides the foundational types used by every workcell component:
//!
//! - **Identifiers**: Strongly-typed, time-sortable IDs for runs, calls and schedule entries
//! - **Storage**: The shared key-value store contract with conditional writes
//! - **Asset Locks**: Lease-based exclusive locks over named assets
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! Nothing in this crate knows about runs, steps or schedules. The lock
//! manager only sees asset names and owner strings.
//!
//! ## Example
//!
//! ```rust
//! use workcell_core::prelude::*;
//!
//! let run = RunId::generate();
//! let backend = MemoryBackend::new();
//! # let _ = (run, backend);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use workcell_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{CallId, RunId, ScheduleEntryId};
    pub use crate::lock::{AssetLockManager, LockInfo};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{CallId, RunId, ScheduleEntryId};
pub use lock::{AssetLockManager, LockInfo};
pub use observability::{LogFormat, init_logging};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
