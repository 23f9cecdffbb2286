use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use softphone_control::EngineConfig;

// =============================================================================
// Tool config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [engine]
//                    command = "twinkle"
//                    transport = "pipes"
//
//   env var:         PHONECTL_ENGINE__TRANSPORT=pipes   (double underscore = nesting)
//
//   (single underscore stays within field names: PHONECTL_ENGINE__IDLE_TIMEOUT_MS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tail: TailFileConfig,
}

/// Log tail tunables (lives under `[tail]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TailFileConfig {
    /// Defaults to `~/.twinkle/twinkle.log`
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TailFileConfig {
    fn default() -> Self {
        Self {
            path: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

/// `~/.config/phonectl/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("phonectl").join("config.toml"))
}

/// Build a figment that layers: defaults → config.toml → PHONECTL_* env vars.
///
/// Command-line flags are applied by the caller on top of the extracted value.
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_path
        .map(Path::to_path_buf)
        .or_else(default_config_path)
    {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("PHONECTL_").split("__"))
}
