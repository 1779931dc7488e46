#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

mod error;
mod klock;
mod port;
mod time;
mod timeout;
mod utils;

pub use self::{
    error::*,
    port::*,
    time::*,
    timeout::{TimeoutEngine, TimeoutFn, TimeoutId},
};
