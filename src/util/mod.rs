//! Utility modules for serverfacts

pub mod command;
pub mod logging;

pub use command::{shell_output, whereis, CommandOutput};
pub use logging::{init_default, init_logging, LoggingConfig};
