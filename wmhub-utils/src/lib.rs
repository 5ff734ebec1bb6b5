//! Common utilities for wmhub
//!
//! Error type, logging setup and path helpers shared by all wmhub crates.

pub mod error;
pub mod logging;
pub mod paths;

pub use error::{HubError, Result};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogOutput};
