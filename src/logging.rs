use std::io;
use std::process;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Output goes to stderr: stdout belongs to
/// the operator view in the coordinator and to the channel in workers.
/// `RUST_LOG` overrides `level`.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

pub fn dev_log(message: &str) {
    if !cfg!(debug_assertions) {
        return;
    }
    tracing::debug!(pid = process::id(), "{message}");
}

#[macro_export]
macro_rules! log_dev {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $crate::logging::dev_log(&format!($($arg)*));
        }
    };
}
