//! Structured logging shared by the relabel crates
//!
//! Output goes to stderr through `emit_term`. The level comes from the
//! `RELABEL_LOG` environment variable:
//! - `off` (default) - no logs
//! - `error`, `warn` - failures only
//! - `info` - stage transitions and counts
//! - `debug` - queries, batches and internal steps

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

/// Environment variable selecting the log level
pub const LOG_ENV: &str = "RELABEL_LOG";

static INIT: Once = Once::new();

/// Map a `RELABEL_LOG` value to a minimum level. `None` disables logging.
///
/// Unknown values map to `Info` and are reported by the second element.
pub fn parse_level(value: &str) -> (Option<emit::Level>, bool) {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "off" => (None, true),
        "debug" => (Some(emit::Level::Debug), true),
        "info" => (Some(emit::Level::Info), true),
        "warn" => (Some(emit::Level::Warn), true),
        "error" => (Some(emit::Level::Error), true),
        _ => (Some(emit::Level::Info), false),
    }
}

/// Initialize diagnostics from `RELABEL_LOG`
///
/// Safe to call more than once; only the first call has any effect.
pub fn init_diagnostics() {
    INIT.call_once(|| {
        let value = std::env::var(LOG_ENV).unwrap_or_else(|_| "off".to_string());
        let (level, recognized) = parse_level(&value);
        let Some(level) = level else {
            return;
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level))
            .init();
        if !recognized {
            // Bootstrap warning; goes out even before a level is known.
            eprintln!("Warning: Unknown {LOG_ENV} value '{value}', using 'info'");
        }

        // The runtime lives for the rest of the process.
        std::mem::forget(rt);
    });
}

/// Log basic operations (stage transitions, counts)
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log detailed diagnostics (queries, batches)
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log conditions that need operator attention but do not abort
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures that abort the run
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

/// Re-export the init function for convenience
pub use init_diagnostics as init;
