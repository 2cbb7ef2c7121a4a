//! Configuration view command — `renderforge config`.

use std::path::Path;

use anyhow::Result;
use renderforge::config::{DEFAULT_CONFIG_PATH, Settings};

pub fn cmd_config(settings: &Settings, config_path: Option<&Path>) -> Result<()> {
    let source = match config_path {
        Some(path) => path.display().to_string(),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => DEFAULT_CONFIG_PATH.to_string(),
        None => "built-in defaults".to_string(),
    };

    println!("# renderforge configuration");
    println!("# file: {}", source);
    println!("# environment overrides and .env applied");
    println!();
    print!("{}", settings.redacted().to_toml()?);
    Ok(())
}
