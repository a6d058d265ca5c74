//! Memory enforcement for execution contexts.
//!
//! - [`MemoryBudget`]: ArrayBuffer allocator charging buffers and the engine
//!   heap against the hard limit
//! - [`install_heap_limit_callback`]: turns engine heap exhaustion into a
//!   terminated context instead of a process abort

pub mod array_buffer_allocator;
pub mod heap_limit;

pub use array_buffer_allocator::{AllocationDenied, EngineHeapProbe, HeapProbe, MemoryBudget};
pub use heap_limit::{HeapLimitState, install_heap_limit_callback};
