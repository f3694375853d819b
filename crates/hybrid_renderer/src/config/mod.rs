//! Configuration file loading
//!
//! Any config type that implements [`Config`] can be read from or written to
//! `.toml` and `.ron` files. The format is picked from the file extension.

pub use serde::{Deserialize, Serialize};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_str_with_format(&contents, path)
    }

    /// Parse configuration text, picking the format from `path`'s extension
    fn from_str_with_format(contents: &str, path: &str) -> Result<Self, ConfigError> {
        match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string())),
            ConfigFormat::Ron => ron::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string())),
        }
    }

    /// Serialize configuration to text in the format `path`'s extension names
    fn to_string_with_format(&self, path: &str) -> Result<String, ConfigError> {
        match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
            }
            ConfigFormat::Ron => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string())),
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = self.to_string_with_format(path)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Ron,
}

impl ConfigFormat {
    fn from_path(path: &str) -> Result<Self, ConfigError> {
        if path.ends_with(".toml") {
            Ok(Self::Toml)
        } else if path.ends_with(".ron") {
            Ok(Self::Ron)
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        frames: u32,
    }

    impl Config for Sample {}

    #[test]
    fn test_unknown_extension_is_rejected() {
        let sample = Sample::default();
        assert!(matches!(
            sample.to_string_with_format("settings.json"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            Sample::from_str_with_format("", "settings.yaml"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_toml_and_ron_parse() {
        let from_toml = Sample::from_str_with_format("name = \"sandbox\"\nframes = 2\n", "a.toml").unwrap();
        let from_ron = Sample::from_str_with_format("(name: \"sandbox\", frames: 2)", "a.ron").unwrap();
        assert_eq!(from_toml, from_ron);
        assert_eq!(from_toml.frames, 2);
    }

    #[test]
    fn test_malformed_input_reports_parse_error() {
        let result = Sample::from_str_with_format("frames = \"not a number\"", "a.toml");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
