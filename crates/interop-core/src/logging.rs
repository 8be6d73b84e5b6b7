//! Process-wide `tracing` subscriber setup.
//!
//! Hosts that already install their own subscriber never need to call
//! [`init`]; every log line in the interop crates goes through `tracing`
//! macros and ends up wherever the host routes them.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Filter directives, checked before `RUST_LOG`.
pub const LOG_ENV: &str = "GPU_INTEROP_LOG";

const DEFAULT_FILTER: &str = "info";

static INIT: OnceCell<bool> = OnceCell::new();

fn filter_directives() -> String {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_FILTER.to_string())
}

/// Install a fmt subscriber filtered by `GPU_INTEROP_LOG` / `RUST_LOG`.
///
/// Safe to call any number of times. Returns `false` when another global
/// subscriber was already installed.
pub fn init() -> bool {
    *INIT.get_or_init(|| {
        let filter = EnvFilter::try_new(filter_directives())
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        let layer = fmt::layer().with_target(true).with_thread_ids(true);

        let installed = Registry::default().with(filter).with(layer).try_init().is_ok();
        if installed {
            tracing::debug!("gpu interop logging initialized");
        }
        installed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let first = init();
        assert_eq!(init(), first);
    }
}
