//! CLI command implementations

pub mod clean;
pub mod config;
pub mod daemon;
pub mod reload;
pub mod run;
pub mod status;
pub mod stop;
pub mod tune;
pub mod wait;
