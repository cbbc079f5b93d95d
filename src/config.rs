use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::enums::StlFormat;
use crate::marching_cubes::MarchingCubesConfig;
use crate::smoothing::SmoothingParams;

pub const MAX_FILENAME_LEN: usize = 128;
const FORBIDDEN_FILENAME_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Filename must not be empty")]
    EmptyFilename,

    #[error("Filename is {0} characters long, at most 128 are allowed")]
    FilenameTooLong(usize),

    #[error("Filename contains forbidden character {0:?}")]
    ForbiddenCharacter(char),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Check a user supplied output name (without extension).
pub fn validate_filename(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::EmptyFilename);
    }
    let length = name.chars().count();
    if length > MAX_FILENAME_LEN {
        return Err(ConfigError::FilenameTooLong(length));
    }
    match name.chars().find(|c| FORBIDDEN_FILENAME_CHARS.contains(c)) {
        Some(c) => Err(ConfigError::ForbiddenCharacter(c)),
        None => Ok(()),
    }
}

/// Settings for one export, passed explicitly to the pipeline.
///
/// Every field has a default, so a JSON file only needs the keys it changes:
///
/// ```json
/// { "smoothing": { "iterations": 30 }, "format": "ascii" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub marching_cubes: MarchingCubesConfig,
    pub smoothing: SmoothingParams,
    pub format: StlFormat,
    /// Solid name written into ASCII output
    pub solid_name: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            marching_cubes: MarchingCubesConfig::default(),
            smoothing: SmoothingParams::default(),
            format: StlFormat::Binary,
            solid_name: "isosurface".to_string(),
        }
    }
}

impl ExportConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn with_marching_cubes(mut self, marching_cubes: MarchingCubesConfig) -> Self {
        self.marching_cubes = marching_cubes;
        self
    }

    pub fn with_smoothing(mut self, smoothing: SmoothingParams) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn with_format(mut self, format: StlFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_solid_name(mut self, name: impl Into<String>) -> Self {
        self.solid_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        assert!(validate_filename("skull").is_ok());
        assert!(validate_filename("patient 12 - bone.v2").is_ok());
        assert!(validate_filename(&"a".repeat(128)).is_ok());
    }

    #[test]
    fn rejects_bad_names() {
        assert!(matches!(validate_filename(""), Err(ConfigError::EmptyFilename)));
        assert!(matches!(validate_filename("   "), Err(ConfigError::EmptyFilename)));
        assert!(matches!(
            validate_filename(&"a".repeat(129)),
            Err(ConfigError::FilenameTooLong(129))
        ));
        for c in FORBIDDEN_FILENAME_CHARS {
            assert!(matches!(
                validate_filename(&format!("bad{c}name")),
                Err(ConfigError::ForbiddenCharacter(found)) if found == c
            ));
        }
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ExportConfig::from_json_str(
            r#"{ "smoothing": { "iterations": 30 }, "format": "ascii" }"#,
        )
        .unwrap();
        assert_eq!(config.smoothing.iterations, 30);
        assert_eq!(config.smoothing.pass_band, 0.1);
        assert_eq!(config.format, StlFormat::Ascii);
        assert_eq!(config.marching_cubes, MarchingCubesConfig::default());
        assert_eq!(config.solid_name, "isosurface");
    }

    #[test]
    fn config_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let config = ExportConfig::default()
            .with_format(StlFormat::Ascii)
            .with_solid_name("femur");
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        assert_eq!(ExportConfig::from_json_file(&path).unwrap(), config);
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(matches!(
            ExportConfig::from_json_str("{ format: }"),
            Err(ConfigError::Parse(_))
        ));
    }
}
