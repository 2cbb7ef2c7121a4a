//! Scene validation command — `renderforge validate`.

use std::path::Path;

use anyhow::{Context, Result};
use renderforge::render::validator::CodeValidator;

/// Returns whether the file passed every rule.
pub fn cmd_validate(file: &Path, json: bool) -> Result<bool> {
    let source = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let result = CodeValidator::new().validate(&source);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.ok {
        println!("{}: ok", file.display());
    } else {
        println!("{}: {} violation(s)", file.display(), result.errors.len());
        for error in &result.errors {
            println!("  - {}", error);
        }
    }
    Ok(result.ok)
}
