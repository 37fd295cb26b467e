//! Empjson Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Ambient plumbing shared by the empjson workspace members.
//!
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//! - **Error Handling**: the error type returned by that setup
//!
//! # Example
//!
//! ```no_run
//! use empjson_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> empjson_common::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
