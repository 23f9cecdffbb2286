//! Files a softphone keeps next to its process.
//!
//! - [`config`]: flat `key=value` account profiles (`~/.twinkle/<profile>.cfg`)
//! - [`tail`]: follow a growing log file line by line

pub mod config;
pub mod error;
pub mod tail;

pub use config::{
    AccountConfig, load_config, save_config, try_load_config, twinkle_profile_path,
};
pub use error::ConfigError;
pub use tail::{TailLines, default_log_path, tail_lines};
