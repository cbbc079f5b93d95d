use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Named Hounsfield Unit thresholds for the tissue classes offered to users
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TissuePreset {
    /// Bone
    #[default]
    HighDensity,
    /// Muscle, organs and brain
    MediumDensity,
    /// Skin and fat
    LowDensity,
}

impl TissuePreset {
    pub const ALL: [TissuePreset; 3] = [
        TissuePreset::HighDensity,
        TissuePreset::MediumDensity,
        TissuePreset::LowDensity,
    ];

    /// Threshold in Hounsfield Units
    pub const fn hounsfield(self) -> f64 {
        match self {
            TissuePreset::HighDensity => 300.0,
            TissuePreset::MediumDensity => 40.0,
            TissuePreset::LowDensity => -50.0,
        }
    }

    /// Short name accepted on the command line
    pub const fn name(self) -> &'static str {
        match self {
            TissuePreset::HighDensity => "bone",
            TissuePreset::MediumDensity => "muscle",
            TissuePreset::LowDensity => "skin",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            TissuePreset::HighDensity => "High Density (Bone)",
            TissuePreset::MediumDensity => "Medium Density (Muscle/Organs/Brain)",
            TissuePreset::LowDensity => "Low Density (Skin)",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown threshold {0:?}, expected a number or one of {names}", names = preset_names())]
pub struct ParseThresholdError(pub String);

fn preset_names() -> String {
    TissuePreset::ALL
        .iter()
        .map(|preset| preset.name())
        .collect::<Vec<_>>()
        .join(", ")
}

impl FromStr for TissuePreset {
    type Err = ParseThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "high_density" | "high" | "bone" => Ok(TissuePreset::HighDensity),
            "medium_density" | "medium" | "muscle" | "organ" | "brain" => {
                Ok(TissuePreset::MediumDensity)
            }
            "low_density" | "low" | "skin" | "fat" => Ok(TissuePreset::LowDensity),
            _ => Err(ParseThresholdError(s.to_string())),
        }
    }
}

/// Isosurface threshold, either a named preset or a custom value in HU.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Preset(TissuePreset),
    Custom(f64),
}

impl Default for Threshold {
    fn default() -> Self {
        Threshold::Preset(TissuePreset::default())
    }
}

impl Threshold {
    pub fn value(self) -> f64 {
        match self {
            Threshold::Preset(preset) => preset.hounsfield(),
            Threshold::Custom(value) => value,
        }
    }
}

impl From<TissuePreset> for Threshold {
    fn from(preset: TissuePreset) -> Self {
        Threshold::Preset(preset)
    }
}

impl From<f64> for Threshold {
    fn from(value: f64) -> Self {
        Threshold::Custom(value)
    }
}

impl FromStr for Threshold {
    type Err = ParseThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(value) = s.trim().parse::<f64>() {
            return if value.is_finite() {
                Ok(Threshold::Custom(value))
            } else {
                Err(ParseThresholdError(s.to_string()))
            };
        }
        s.parse::<TissuePreset>().map(Threshold::Preset)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Preset(preset) => write!(f, "{} ({} HU)", preset.label(), preset.hounsfield()),
            Threshold::Custom(value) => write!(f, "{value} HU"),
        }
    }
}

/// Stage names reported to progress observers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportStage {
    MarchingCubes,
    Smoothing,
    Writing,
    Complete,
}

impl ExportStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            ExportStage::MarchingCubes => "marching-cubes",
            ExportStage::Smoothing => "smoothing",
            ExportStage::Writing => "writing",
            ExportStage::Complete => "complete",
        }
    }
}

impl fmt::Display for ExportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StlFormat {
    #[default]
    Binary,
    Ascii,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_map_to_fixed_hounsfield_values() {
        assert_eq!(Threshold::from(TissuePreset::HighDensity).value(), 300.0);
        assert_eq!(Threshold::from(TissuePreset::MediumDensity).value(), 40.0);
        assert_eq!(Threshold::from(TissuePreset::LowDensity).value(), -50.0);
        assert_eq!(Threshold::default().value(), 300.0);
    }

    #[test]
    fn threshold_parses_numbers_and_names() {
        assert_eq!("300".parse::<Threshold>(), Ok(Threshold::Custom(300.0)));
        assert_eq!("-50.5".parse::<Threshold>(), Ok(Threshold::Custom(-50.5)));
        assert_eq!(
            "HIGH_DENSITY".parse::<Threshold>(),
            Ok(Threshold::Preset(TissuePreset::HighDensity))
        );
        assert_eq!(
            "skin".parse::<Threshold>(),
            Ok(Threshold::Preset(TissuePreset::LowDensity))
        );
        assert_eq!(
            "medium-density".parse::<Threshold>(),
            Ok(Threshold::Preset(TissuePreset::MediumDensity))
        );
        assert!("cartilage".parse::<Threshold>().is_err());
        assert!("NaN".parse::<Threshold>().is_err());
    }

    #[test]
    fn preset_names_parse_back_and_appear_in_errors() {
        for preset in TissuePreset::ALL {
            assert_eq!(preset.name().parse::<TissuePreset>(), Ok(preset));
        }
        let err = "cartilage".parse::<Threshold>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown threshold \"cartilage\", expected a number or one of bone, muscle, skin"
        );
    }

    #[test]
    fn threshold_deserializes_from_preset_or_number() {
        let preset: Threshold = serde_json::from_str("\"LOW_DENSITY\"").unwrap();
        assert_eq!(preset, Threshold::Preset(TissuePreset::LowDensity));
        let custom: Threshold = serde_json::from_str("120.0").unwrap();
        assert_eq!(custom, Threshold::Custom(120.0));
    }

    #[test]
    fn stage_names_match_wire_format() {
        let names: Vec<_> = [
            ExportStage::MarchingCubes,
            ExportStage::Smoothing,
            ExportStage::Writing,
            ExportStage::Complete,
        ]
        .iter()
        .map(|stage| stage.to_string())
        .collect();
        assert_eq!(names, ["marching-cubes", "smoothing", "writing", "complete"]);
        assert_eq!(
            serde_json::to_string(&ExportStage::MarchingCubes).unwrap(),
            "\"marching-cubes\""
        );
    }
}
