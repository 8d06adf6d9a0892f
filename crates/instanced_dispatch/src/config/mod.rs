//! Configuration system
//!
//! Ring sizing, fence timeouts and binding slots are plain serde structs so hosts can
//! ship them in TOML or RON next to their other engine settings.

pub use serde::{Deserialize, Serialize};

mod dispatch;

pub use dispatch::{BindingSlots, DispatchConfig};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A value failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_extension_is_rejected() {
        let result = DispatchConfig::load_from_file("dispatch.yaml");
        // Missing file is reported before the extension check
        assert!(matches!(result, Err(ConfigError::Io(_))));

        let config = DispatchConfig::default();
        let path = std::env::temp_dir().join("instanced_dispatch_config_test.yaml");
        let result = config.save_to_file(path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let config = DispatchConfig::default()
            .with_section_count(4)
            .with_fence_timeout_ns(1_000);
        let path = std::env::temp_dir().join(format!(
            "instanced_dispatch_config_{}.toml",
            std::process::id()
        ));
        let path = path.to_str().unwrap();

        config.save_to_file(path).unwrap();
        let loaded = DispatchConfig::load_from_file(path).unwrap();
        std::fs::remove_file(path).ok();

        assert_eq!(loaded.section_count, 4);
        assert_eq!(loaded.fence_timeout_ns, 1_000);
        assert_eq!(loaded.part_section_bytes, config.part_section_bytes);
    }
}
