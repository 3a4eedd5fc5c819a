//! Common helpers used throughout the storage layer.
//!
//! This must not depend on any crate more closely related to the storage
//! engine itself than the api types.

pub mod lock;
pub mod task;

mod command;
pub use command::{
    command_output, command_output_as_string, run_command, run_command_timeout,
    run_command_with_output, run_pipeline,
};
