// Allow dead code for items that are part of the public API but only used in tests
#![allow(dead_code)]

pub mod config;
pub mod convert;
pub mod error;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod protect;
pub mod schema;
