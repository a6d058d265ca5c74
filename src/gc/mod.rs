//! Isolate binding and external memory accounting.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ExecutionLock (RAII)                                       │
//! │  ├── Rejects terminated contexts                            │
//! │  ├── Publishes the isolate in a thread-local                │
//! │  └── Applies deferred external memory on construction       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ExternalMemoryLedger (per context)                         │
//! │  └── Atomic delta filled by backing-store deleters          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ExternalMemoryGuard (RAII)                                 │
//! │  ├── Reports wrapped host memory on creation                │
//! │  └── Defers the matching release through the ledger         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod execution_lock;
mod external_memory;

pub use execution_lock::ExecutionLock;
pub use external_memory::{ExternalMemoryGuard, ExternalMemoryLedger};

pub(crate) use execution_lock::with_current_isolate;

#[cfg(test)]
pub(crate) use execution_lock::has_current_isolate;
