//! Configuration system for the Braid agent library.
//!
//! Provides TOML-based configuration with:
//! - Agent defaults (`[agent]`): system prompt, recursion limit, tool concurrency
//! - Call limits (`[limits.model_calls]`, `[limits.tool_calls]`)
//! - Retry policies (`[retry.model]`, `[retry.tools]`)
//! - History summarization thresholds (`[summarization]`)
//! - Checkpoint verification (`[checkpoint]`)
//!
//! Files are layered: later layers override earlier ones field by field.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{LoadedConfig, load_config, load_config_file, load_layered, user_config_path};
pub use error::{ConfigError, Result};
pub use types::*;
