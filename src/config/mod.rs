mod schema;

pub use schema::*;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    for (i, node) in config.nodes.iter().enumerate() {
        if config.nodes[..i].iter().any(|n| n.name == node.name) {
            return Err(ConfigError::Invalid(format!(
                "duplicate sharding node '{}'",
                node.name
            )));
        }
    }
    let flow = &config.flow_control;
    if flow.enabled && flow.end > flow.start {
        return Err(ConfigError::Invalid(format!(
            "flow_control.end ({}) must not exceed flow_control.start ({})",
            flow.end, flow.start
        )));
    }
    Ok(())
}
