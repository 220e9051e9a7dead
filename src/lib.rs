#![doc = include_str!("../README.md")]
#![warn(clippy::panic_in_result_fn, clippy::missing_assert_message)]

#[cfg(not(unix))]
compile_error!("the papa kernel holds sockets and children for its clients by Unix means only");

pub mod command;
pub mod error;
pub mod kernel;
pub mod matcher;
pub mod os;
pub mod process;
pub mod ring;
pub mod server;
pub mod session;
pub mod socket;
pub mod values;
pub mod wire;

mod misc;

pub use error::Error;

#[cfg(test)]
#[path = "../tests/index.rs"]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects, clippy::indexing_slicing)]
mod tests;
