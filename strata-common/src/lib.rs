//! Shared infrastructure for the strata workspace.
//!
//! - [`error`]: workspace-wide error enum and the `Result` alias
//! - [`logging`]: tracing setup with library noise suppression

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod error;
pub mod logging;

pub use error::{Error, Result, ResultExt};
pub use logging::init_logging;
