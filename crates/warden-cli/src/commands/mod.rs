//! Subcommands

pub mod enqueue;
pub mod gc;
pub mod list;
pub mod run;
pub mod stats;
