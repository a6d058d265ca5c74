//! Per-context memory budget configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MIB: usize = 1024 * 1024;

/// Memory ceilings for one execution context.
///
/// - `soft_limit_bytes` caps the engine's own heap and drives its GC pressure.
/// - `hard_limit_bytes` is the point past which buffer allocations are denied,
///   and the most the heap may grow to when it runs into the soft limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    pub soft_limit_bytes: usize,
    pub hard_limit_bytes: usize,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            soft_limit_bytes: 64 * MIB,
            hard_limit_bytes: 128 * MIB,
        }
    }
}

impl Budget {
    pub fn new(soft_limit_bytes: usize, hard_limit_bytes: usize) -> Self {
        Self {
            soft_limit_bytes,
            hard_limit_bytes,
        }
    }

    /// A budget whose soft limit equals its hard limit.
    pub fn with_hard_limit(hard_limit_bytes: usize) -> Self {
        Self::new(hard_limit_bytes, hard_limit_bytes)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hard_limit_bytes == 0 {
            return Err(Error::InvalidBudget(
                "hard limit must be greater than zero".to_string(),
            ));
        }

        if self.soft_limit_bytes > self.hard_limit_bytes {
            return Err(Error::InvalidBudget(format!(
                "soft limit ({} bytes) exceeds hard limit ({} bytes)",
                self.soft_limit_bytes, self.hard_limit_bytes
            )));
        }

        Ok(())
    }
}
