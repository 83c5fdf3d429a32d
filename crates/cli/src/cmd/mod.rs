//! CLI command implementations

pub mod config;
pub mod du;
pub mod ls;
pub mod watch;
