pub mod buffer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod exception;
pub mod gc;
pub mod platform;
pub mod security;
pub mod snapshot;
pub mod termination;
pub mod value;

mod script;
mod state;

// Core API
pub use channel::{CallFrame, MessageHandler};
pub use config::Budget;
pub use context::{ExecutionContext, ExecutionContextBuilder, HeapStatistics};
pub use error::{Error, Result};
pub use platform::engine_version;
pub use snapshot::{SnapshotBlob, create_snapshot, try_create_snapshot};
pub use state::Phase;
pub use termination::TerminationHandle;
pub use value::{HostBuffer, Message, ScriptBuffer, TaggedValue};
