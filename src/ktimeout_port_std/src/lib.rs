#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]

mod cpu;
mod manual;
mod timer;


pub use self::{
    cpu::{current_cpu_id, is_cpu_lock_active},
    manual::ManualPort,
    timer::{StdPort, TimerThread},
};

/// Re-exported so that applications can set up logging without depending on
/// `env_logger` directly
pub extern crate env_logger;

/// Initialize `env_logger` once. Subsequent calls are no-ops.
///
/// The log level is controlled by the `RUST_LOG` environment variable as
/// usual, e.g., `RUST_LOG=ktimeout=trace`.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(cfg!(test)).try_init();
}
