//! lfsgc command line and daemon
//!
//! This crate provides:
//! - The daemon event loop around the cleaner scheduler
//! - The IPC protocol between the daemon and its clients
//! - Pid file locking and config file loading
//! - The `lfsgc` subcommands

pub mod cmd;
pub mod daemon;
pub mod ipc;
pub mod locks;
pub mod system_config;
pub mod util;
