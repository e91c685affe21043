use crate::defaults;
use crate::error::{Result, VoxliveError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub session: SessionConfig,
    /// Language persona catalog: language key → system instruction text.
    /// Entries here extend/override the built-in catalog.
    pub personas: BTreeMap<String, String>,
}

/// Audio device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AudioConfig {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

/// Remote session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub endpoint: String,
    pub language: String,
    pub voice: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::DEFAULT_ENDPOINT.to_string(),
            language: defaults::DEFAULT_LANGUAGE.to_string(),
            voice: defaults::DEFAULT_VOICE.to_string(),
        }
    }
}

/// Built-in language personas. Config-file entries override these.
fn builtin_personas() -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (key, name) in [
        ("en", "English"),
        ("es", "Spanish"),
        ("fr", "French"),
        ("de", "German"),
        ("ja", "Japanese"),
    ] {
        map.insert(
            key.to_string(),
            format!(
                "You are a friendly {} conversation partner. \
                 Speak only {}, keep replies short and conversational, \
                 and gently correct the speaker's mistakes.",
                name, name
            ),
        );
    }
    map
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Full persona catalog: built-ins merged with config-file entries.
    pub fn persona_catalog(&self) -> BTreeMap<String, String> {
        let mut catalog = builtin_personas();
        for (key, instruction) in &self.personas {
            catalog.insert(key.clone(), instruction.clone());
        }
        catalog
    }

    /// Resolve the system instruction for a language key.
    ///
    /// # Errors
    /// Returns `VoxliveError::UnknownPersona` if the key is in neither the
    /// built-in catalog nor the config file.
    pub fn resolve_persona(&self, key: &str) -> Result<String> {
        self.persona_catalog()
            .get(key)
            .cloned()
            .ok_or_else(|| VoxliveError::UnknownPersona {
                key: key.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_has_expected_session() {
        let config = Config::default();
        assert_eq!(config.session.language, "en");
        assert_eq!(config.session.voice, defaults::DEFAULT_VOICE);
        assert_eq!(config.session.endpoint, defaults::DEFAULT_ENDPOINT);
        assert!(config.audio.input_device.is_none());
        assert!(config.audio.output_device.is_none());
    }

    #[test]
    fn builtin_personas_cover_default_language() {
        let config = Config::default();
        let instruction = config.resolve_persona(defaults::DEFAULT_LANGUAGE).unwrap();
        assert!(instruction.contains("English"));
    }

    #[test]
    fn unknown_persona_is_an_error() {
        let config = Config::default();
        let err = config.resolve_persona("xx").unwrap_err();
        assert!(matches!(err, VoxliveError::UnknownPersona { .. }));
    }

    #[test]
    fn config_file_persona_overrides_builtin() {
        let mut config = Config::default();
        config
            .personas
            .insert("en".to_string(), "Custom tutor prompt".to_string());
        assert_eq!(config.resolve_persona("en").unwrap(), "Custom tutor prompt");
        // Built-ins not overridden remain available.
        assert!(config.resolve_persona("es").is_ok());
    }

    #[test]
    fn load_parses_partial_toml_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[session]\nlanguage = \"es\"\n\n[personas]\nes = \"Solo español.\""
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.session.language, "es");
        // Unset fields fall back to defaults.
        assert_eq!(config.session.voice, defaults::DEFAULT_VOICE);
        assert_eq!(config.resolve_persona("es").unwrap(), "Solo español.");
    }

    #[test]
    fn load_tolerates_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "future_option = true\n\n[session]\nvoice = \"Kore\"\nexperimental = 3"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.session.voice, "Kore");
    }

    #[test]
    fn load_rejects_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "session = language =").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn load_or_default_returns_defaults_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let config = Config::load_or_default(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = Config::default();
        config.audio.input_device = Some("pipewire".to_string());
        config.session.language = "fr".to_string();

        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
