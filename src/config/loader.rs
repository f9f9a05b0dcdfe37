//! Gateway configuration loading.
//!
//! The gateway reads one YAML, JSON or TOML file, picked by extension
//! (anything unrecognized is treated as YAML). [`load_config`] parses and
//! applies the startup invariants in a single step, which is what `serve`
//! wants; [`read_config`] stops after parsing so the `validate` subcommand
//! can report the parse and invariant stages separately. Route definitions
//! never appear in this file; they live in the route store it selects.

use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Result, WrapErr, eyre};

use crate::config::models::HarborConfig;

fn format_for(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    }
}

/// Parse the config file without checking startup invariants.
pub fn read_config(path: impl AsRef<Path>) -> Result<HarborConfig> {
    let path = path.as_ref();
    let source = path
        .to_str()
        .ok_or_else(|| eyre!("config path is not valid UTF-8: {}", path.display()))?;

    let raw = Config::builder()
        .add_source(File::new(source, format_for(path)))
        .build()
        .wrap_err_with(|| format!("cannot read gateway config at {}", path.display()))?;

    raw.try_deserialize::<HarborConfig>().wrap_err_with(|| {
        format!(
            "gateway config at {} does not match the expected shape",
            path.display()
        )
    })
}

/// Parse and validate the config file. Startup goes through this and maps
/// any failure to exit code 1.
pub fn load_config(path: impl AsRef<Path>) -> Result<HarborConfig> {
    let config = read_config(path.as_ref())?;
    config
        .validate()
        .map_err(|violation| eyre!(violation))
        .wrap_err_with(|| format!("gateway config at {} is invalid", path.as_ref().display()))?;
    Ok(config)
}
