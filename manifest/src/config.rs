//! Compiler and runtime configuration.
//!
//! Loaded from TOML, optionally overridden by `MANIFEST_*` environment
//! variables:
//!
//! ```toml
//! [compiler]
//! use_cache = true
//! unknown_characters = "warn"
//! max_nesting_depth = 64
//!
//! [runtime]
//! require_valid_provenance = true
//! computed_cycles = "strict"
//! enforce_versions = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ir::CompileOptions;
use crate::lexer::UnknownCharPolicy;
use crate::parser::DEFAULT_MAX_NESTING_DEPTH;
use crate::runtime::{ComputedCycleMode, RuntimeOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value '{value}' for {var}")]
    InvalidEnv { var: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub compiler: CompilerConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub use_cache: bool,
    pub unknown_characters: UnknownCharPolicy,
    pub max_nesting_depth: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            use_cache: true,
            unknown_characters: UnknownCharPolicy::Warn,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub require_valid_provenance: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_ir_hash: Option<String>,
    pub computed_cycles: ComputedCycleMode,
    pub enforce_versions: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            require_valid_provenance: false,
            expected_ir_hash: None,
            computed_cycles: ComputedCycleMode::Strict,
            enforce_versions: true,
        }
    }
}

impl ManifestConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Defaults with `MANIFEST_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MANIFEST_USE_CACHE") {
            self.compiler.use_cache = parse_bool("MANIFEST_USE_CACHE", &v)?;
        }
        if let Some(v) = lookup("MANIFEST_UNKNOWN_CHARACTERS") {
            self.compiler.unknown_characters = match v.trim().to_ascii_lowercase().as_str() {
                "skip" => UnknownCharPolicy::Skip,
                "warn" => UnknownCharPolicy::Warn,
                "error" => UnknownCharPolicy::Error,
                _ => return Err(invalid("MANIFEST_UNKNOWN_CHARACTERS", &v)),
            };
        }
        if let Some(v) = lookup("MANIFEST_MAX_NESTING_DEPTH") {
            self.compiler.max_nesting_depth = match v.trim().parse::<usize>() {
                Ok(depth) if depth > 0 => depth,
                _ => return Err(invalid("MANIFEST_MAX_NESTING_DEPTH", &v)),
            };
        }
        if let Some(v) = lookup("MANIFEST_REQUIRE_VALID_PROVENANCE") {
            self.runtime.require_valid_provenance =
                parse_bool("MANIFEST_REQUIRE_VALID_PROVENANCE", &v)?;
        }
        if let Some(v) = lookup("MANIFEST_EXPECTED_IR_HASH") {
            let v = v.trim();
            self.runtime.expected_ir_hash = (!v.is_empty()).then(|| v.to_string());
        }
        if let Some(v) = lookup("MANIFEST_COMPUTED_CYCLES") {
            self.runtime.computed_cycles = match v.trim().to_ascii_lowercase().as_str() {
                "strict" => ComputedCycleMode::Strict,
                "permissive" => ComputedCycleMode::Permissive,
                _ => return Err(invalid("MANIFEST_COMPUTED_CYCLES", &v)),
            };
        }
        if let Some(v) = lookup("MANIFEST_ENFORCE_VERSIONS") {
            self.runtime.enforce_versions = parse_bool("MANIFEST_ENFORCE_VERSIONS", &v)?;
        }
        Ok(())
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            use_cache: self.compiler.use_cache,
            unknown_characters: self.compiler.unknown_characters,
            max_nesting_depth: self.compiler.max_nesting_depth,
        }
    }

    /// Runtime options with the system clock and random ids.
    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            require_valid_provenance: self.runtime.require_valid_provenance,
            expected_ir_hash: self.runtime.expected_ir_hash.clone(),
            computed_cycles: self.runtime.computed_cycles,
            enforce_versions: self.runtime.enforce_versions,
            ..RuntimeOptions::default()
        }
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value)),
    }
}

fn invalid(var: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = ManifestConfig::from_toml_str("").unwrap();
        assert_eq!(config, ManifestConfig::default());
        assert!(config.compiler.use_cache);
        assert!(config.runtime.enforce_versions);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = ManifestConfig::from_toml_str(
            "[runtime]\ncomputed_cycles = \"permissive\"\nexpected_ir_hash = \"abc\"\n",
        )
        .unwrap();
        assert_eq!(config.runtime.computed_cycles, ComputedCycleMode::Permissive);
        assert_eq!(config.runtime.expected_ir_hash.as_deref(), Some("abc"));
        assert_eq!(config.compiler, CompilerConfig::default());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[compiler]\nuse_cache = false\nunknown_characters = \"error\"").unwrap();
        let config = ManifestConfig::from_file(file.path()).unwrap();
        assert!(!config.compiler.use_cache);
        assert_eq!(config.compile_options().unknown_characters, UnknownCharPolicy::Error);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.toml");
        let mut config = ManifestConfig::default();
        config.runtime.require_valid_provenance = true;
        config.save_to_file(&path).unwrap();
        assert_eq!(ManifestConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(matches!(
            ManifestConfig::from_toml_str("[compiler]\nuse_cache = \"maybe\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MANIFEST_USE_CACHE", "off"),
            ("MANIFEST_COMPUTED_CYCLES", "Permissive"),
            ("MANIFEST_EXPECTED_IR_HASH", "deadbeef"),
            ("MANIFEST_ENFORCE_VERSIONS", "0"),
            ("MANIFEST_MAX_NESTING_DEPTH", "16"),
        ]
        .into_iter()
        .collect();
        let mut config = ManifestConfig::default();
        config
            .apply_env(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();
        assert!(!config.compiler.use_cache);
        assert_eq!(config.runtime.computed_cycles, ComputedCycleMode::Permissive);
        assert_eq!(config.compile_options().max_nesting_depth, 16);

        let options = config.runtime_options();
        assert_eq!(options.expected_ir_hash.as_deref(), Some("deadbeef"));
        assert!(!options.enforce_versions);
    }

    #[test]
    fn invalid_env_value_names_the_variable() {
        let mut config = ManifestConfig::default();
        let err = config
            .apply_env(|var| (var == "MANIFEST_UNKNOWN_CHARACTERS").then(|| "loud".to_string()))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid value 'loud' for MANIFEST_UNKNOWN_CHARACTERS");
    }

    #[test]
    fn nesting_depth_must_be_positive() {
        let mut config = ManifestConfig::default();
        for bad in ["0", "-3", "deep"] {
            let err = config
                .apply_env(|var| (var == "MANIFEST_MAX_NESTING_DEPTH").then(|| bad.to_string()))
                .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidEnv { .. }), "{}", bad);
        }
        assert_eq!(config.compiler.max_nesting_depth, DEFAULT_MAX_NESTING_DEPTH);
    }
}
