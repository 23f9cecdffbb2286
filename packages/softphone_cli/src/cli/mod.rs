pub mod dial;
pub mod profile;
pub mod run;
pub mod tail;

use std::time::Duration;

/// How long interactive commands wait for the softphone's start-up banner
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);
