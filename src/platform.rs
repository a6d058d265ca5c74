//! Global V8 platform initialization.
//!
//! V8 can only be initialized once per process. This module provides
//! a single entry point for platform initialization used by all other modules.

use std::sync::OnceLock;

static PLATFORM: OnceLock<v8::SharedRef<v8::Platform>> = OnceLock::new();

/// Extra engine flags, applied once before the platform is initialized.
pub const FLAGS_ENV: &str = "V8_BRIDGE_FLAGS";

/// Get the global V8 platform, initializing it if necessary.
///
/// This is safe to call from multiple threads - the platform is only
/// initialized once and the same reference is returned to all callers.
pub fn get_platform() -> &'static v8::SharedRef<v8::Platform> {
    PLATFORM.get_or_init(|| {
        // Better for small heaps, and keeps snapshot creation deterministic
        v8::V8::set_flags_from_string("--noincremental-marking");

        #[cfg(target_os = "macos")]
        v8::V8::set_flags_from_string("--single-threaded-gc");

        if let Ok(flags) = std::env::var(FLAGS_ENV)
            && !flags.trim().is_empty()
        {
            tracing::debug!("Applying engine flags from {}: {}", FLAGS_ENV, flags);
            v8::V8::set_flags_from_string(&flags);
        }

        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();
        platform
    })
}

/// Version string of the embedded engine build.
pub fn engine_version() -> &'static str {
    v8::V8::get_version()
}
