//! Process-wide logger setup.
//!
//! Binaries call [`init`] once at the top of `run()`; library code only uses
//! the `log` macros.

use env_logger::{Builder, Env};

/// Install the `env_logger` backend. `RUST_LOG` overrides `default_level`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(default_level: &str) {
    let env = Env::default().filter_or("RUST_LOG", default_level);
    let _ = Builder::from_env(env)
        .format_timestamp_millis()
        .format_module_path(false)
        .try_init();
}
