//! Loading mix configuration from YAML

use super::schema::MixSpec;
use super::validate::validate_config;
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Parse and validate a YAML mix specification
///
/// # Example
///
/// ```
/// use mezclar::config::from_yaml_str;
///
/// let spec = from_yaml_str("policies:\n  mixup:\n    alpha: 0.4\n")?;
/// assert_eq!(spec.policies.len(), 1);
/// # Ok::<(), mezclar::Error>(())
/// ```
pub fn from_yaml_str(yaml: &str) -> Result<MixSpec> {
    let spec: MixSpec = serde_yaml::from_str(yaml)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {}", e)))?;

    validate_config(&spec)?;

    Ok(spec)
}

/// Load a mix specification from a YAML file
///
/// Every policy name, hyperparameter key and value is checked here, so a
/// returned spec builds without configuration errors.
pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<MixSpec> {
    let yaml_content = fs::read_to_string(config_path.as_ref()).map_err(|e| {
        Error::ConfigError(format!(
            "Failed to read config file {}: {}",
            config_path.as_ref().display(),
            e
        ))
    })?;

    from_yaml_str(&yaml_content)
}
