use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use softphone_files::{
    AccountConfig, ConfigError, load_config, save_config, try_load_config, twinkle_profile_path,
};
use tracing::info;

/// A bare name is a Twinkle profile; anything that looks like a path is used as-is
pub fn resolve_profile_path(profile: &str) -> Result<PathBuf> {
    let candidate = Path::new(profile);
    if candidate.extension().is_some() || candidate.components().count() > 1 {
        return Ok(candidate.to_path_buf());
    }
    twinkle_profile_path(profile).context("Cannot determine home directory")
}

/// Split `key=value`; the value may be empty or contain `=`
pub fn parse_assignment(assignment: &str) -> Result<(&str, &str)> {
    let Some((key, value)) = assignment.split_once('=') else {
        bail!("Expected key=value, got '{}'", assignment);
    };
    if key.trim().is_empty() {
        bail!("Empty key in '{}'", assignment);
    }
    Ok((key, value))
}

pub fn show_command(profile: &str, json: bool) -> Result<()> {
    let path = resolve_profile_path(profile)?;
    let config = load_config(&path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config.to_map())?);
    } else {
        for (key, value) in config.iter() {
            println!("{key}={value}");
        }
    }
    Ok(())
}

/// Apply assignments to a profile, creating it if it does not exist yet.
///
/// A malformed profile is left untouched.
pub fn set_command(profile: &str, assignments: &[String]) -> Result<()> {
    let path = resolve_profile_path(profile)?;
    let mut config = match try_load_config(&path) {
        Ok(config) => config,
        Err(ConfigError::Read { source, .. }) if source.kind() == ErrorKind::NotFound => {
            info!("Creating new profile {}", path.display());
            AccountConfig::new()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Not updating {}", path.display()));
        }
    };

    for assignment in assignments {
        let (key, value) = parse_assignment(assignment)?;
        config.set(key, value);
    }

    save_config(&path, &config)?;
    info!("Updated {} key(s) in {}", assignments.len(), path.display());
    Ok(())
}
