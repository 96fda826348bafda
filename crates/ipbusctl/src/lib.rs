//! Command implementations for the `ipbusctl` binary.

pub mod cmd_dummy;
pub mod cmd_get;
pub mod cmd_nodes;
pub mod cmd_selftest;
pub mod cmd_set;
pub mod common;
