//! Configuration management module.

mod config;

pub use config::*;
