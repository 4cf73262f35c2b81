#![doc = "Common types shared across the panda-wifi-bench workspace."]

pub mod config;
pub mod error;
pub mod metrics;

pub use config::*;
pub use error::*;
pub use metrics::*;
