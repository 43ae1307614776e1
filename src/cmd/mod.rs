//! CLI entry points: config load -> state build -> router -> graceful
//! shutdown, for both binaries this crate ships.

pub mod controller;
pub mod runtime;
