//! Account profiles
//!
//! Twinkle stores each SIP account as a flat text file of `key=value` lines.
//! Lines starting with `#` are comments, blank lines are skipped, and a line
//! without `=` is a key with an empty value. The value is everything after
//! the first `=`, so values may themselves contain `=`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::error::ConfigError;

/// Ordered `key=value` mapping; keys keep the position they first appeared at
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountConfig {
    entries: Vec<(String, String)>,
}

impl AccountConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace; a replaced key keeps its position
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries.iter().cloned().collect()
    }

    /// Parse profile text.
    ///
    /// Returns `None` when a line has an empty key; callers treat the whole
    /// file as unusable in that case.
    pub fn parse(text: &str) -> Option<Self> {
        let mut config = Self::new();
        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').unwrap_or((line, ""));
            if key.trim().is_empty() {
                error!("Empty key on line {}", number + 1);
                return None;
            }
            config.set(key, value);
        }
        Some(config)
    }

    /// Render as profile text, one `key=value` per line
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

impl FromIterator<(String, String)> for AccountConfig {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut config = Self::new();
        for (key, value) in iter {
            config.set(key, value);
        }
        config
    }
}

impl From<AccountConfig> for BTreeMap<String, String> {
    fn from(config: AccountConfig) -> Self {
        config.entries.into_iter().collect()
    }
}

/// Load an account profile, failing on malformed content.
///
/// Use this before rewriting a profile so a bad file is never replaced by a
/// partial one.
pub fn try_load_config<P: AsRef<Path>>(path: P) -> Result<AccountConfig, ConfigError> {
    let path = path.as_ref();
    let malformed = |reason: String| ConfigError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8(bytes).map_err(|e| malformed(format!("not UTF-8: {e}")))?;
    let config =
        AccountConfig::parse(&text).ok_or_else(|| malformed("line with an empty key".to_string()))?;

    debug!("Loaded {} keys from {}", config.len(), path.display());
    Ok(config)
}

/// Load an account profile.
///
/// A file that cannot be read is an error. A file that is read but malformed
/// (not UTF-8, or a line with an empty key) yields an empty config and an
/// error log, never a partial result.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AccountConfig, ConfigError> {
    match try_load_config(path) {
        Err(e @ ConfigError::Malformed { .. }) => {
            error!("{}, ignoring it", e);
            Ok(AccountConfig::default())
        }
        result => result,
    }
}

/// Write an account profile, creating parent directories as needed
pub fn save_config<P: AsRef<Path>>(path: P, config: &AccountConfig) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    fs::write(path, config.render()).map_err(write_err)?;
    debug!("Saved {} keys to {}", config.len(), path.display());
    Ok(())
}

/// `~/.twinkle/<profile>.cfg`
pub fn twinkle_profile_path(profile: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".twinkle").join(format!("{profile}.cfg")))
}
