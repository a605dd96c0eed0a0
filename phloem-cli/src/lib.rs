//! phloem CLI library
//!
//! Configuration loading and output rendering, exposed for testing.

pub mod config;
pub mod output;
