//! Building specs and experiment manifests
//!
//! ## Table of Contents
//! - **BuildingSpec**: One simulation unit (geometry, envelope, weather, semantics)
//! - **ExtraSpace**: Basement/attic occupation and conditioning status
//! - **FeatureValue**: Text/int/float value of a semantic field or feature
//! - **ExperimentSpec**: YAML manifest describing a run
//! - **HourlyDataConfig**: Which hourly variables to capture and how to emit them

use crate::error::{FanoutError, Result};
use crate::types::{RunName, SpecId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Minimum edge length accepted for a footprint, in metres
pub const MIN_EDGE_LENGTH: f64 = 3.0;

/// Edge length above which core/perimeter zoning is used, in metres
pub const CORE_PERIMETER_EDGE: f64 = 15.0;

/// Value of a semantic field or derived feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Categorical value
    Text(String),
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

/// Occupation/conditioning status of a basement or attic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraSpace {
    /// No such space
    #[default]
    None,
    /// Present, neither occupied nor conditioned
    UnoccupiedUnconditioned,
    /// Present, conditioned but not occupied
    UnoccupiedConditioned,
    /// Present, occupied but not conditioned
    OccupiedUnconditioned,
    /// Present, occupied and conditioned
    OccupiedConditioned,
}

impl ExtraSpace {
    /// Whether the space exists
    pub fn exists(self) -> bool {
        self != Self::None
    }

    /// Whether the space is occupied
    pub fn is_occupied(self) -> bool {
        matches!(self, Self::OccupiedUnconditioned | Self::OccupiedConditioned)
    }

    /// Whether the space is conditioned
    pub fn is_conditioned(self) -> bool {
        matches!(self, Self::UnoccupiedConditioned | Self::OccupiedConditioned)
    }
}

/// Thermal zoning layout chosen from the footprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Zoning {
    /// One zone per storey
    ByStorey,
    /// Core and perimeter zones per storey
    CorePerimeter,
}

impl fmt::Display for Zoning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByStorey => f.write_str("by_storey"),
            Self::CorePerimeter => f.write_str("core/perim"),
        }
    }
}

/// One simulation unit
///
/// Immutable once produced by the spec-generation stage; the planner and
/// workers only read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingSpec {
    /// Stable id, used as the row key of every dataframe
    pub building_id: SpecId,
    /// Length of the long footprint edge [m]
    pub long_edge: f64,
    /// Length of the short footprint edge [m]
    pub short_edge: f64,
    /// Orientation of the long edge [rad]
    #[serde(default)]
    pub long_edge_angle: f64,
    /// Number of above-ground floors
    pub num_floors: u32,
    /// Floor-to-floor height [m]
    pub f2f_height: f64,
    /// Window-to-wall ratio [0, 1]
    pub wwr: f64,
    /// Basement type
    #[serde(default)]
    pub basement: ExtraSpace,
    /// Attic type
    #[serde(default)]
    pub attic: ExtraSpace,
    /// Fraction of the basement exposed to outdoor air [0, 1]
    #[serde(default = "default_exposed_basement_frac")]
    pub exposed_basement_frac: f64,
    /// Weather file reference (local path or URI of an EPW zip)
    pub weather: String,
    /// Semantic field values used to select construction components
    #[serde(default)]
    pub semantic_context: BTreeMap<String, FeatureValue>,
}

fn default_exposed_basement_frac() -> f64 {
    0.25
}

impl BuildingSpec {
    /// Create a spec with default envelope values
    pub fn new(
        building_id: impl Into<SpecId>,
        length: f64,
        width: f64,
        num_floors: u32,
        weather: impl Into<String>,
    ) -> Self {
        let (long_edge, short_edge) = if length >= width {
            (length, width)
        } else {
            (width, length)
        };
        Self {
            building_id: building_id.into(),
            long_edge,
            short_edge,
            long_edge_angle: 0.0,
            num_floors,
            f2f_height: 3.0,
            wwr: 0.2,
            basement: ExtraSpace::None,
            attic: ExtraSpace::None,
            exposed_basement_frac: default_exposed_basement_frac(),
            weather: weather.into(),
            semantic_context: BTreeMap::new(),
        }
    }

    /// Set window-to-wall ratio
    pub fn with_wwr(mut self, wwr: f64) -> Self {
        self.wwr = wwr;
        self
    }

    /// Set floor-to-floor height
    pub fn with_f2f_height(mut self, height: f64) -> Self {
        self.f2f_height = height;
        self
    }

    /// Set basement and attic
    pub fn with_extra_spaces(mut self, basement: ExtraSpace, attic: ExtraSpace) -> Self {
        self.basement = basement;
        self.attic = attic;
        self
    }

    /// Add a semantic field value
    pub fn with_semantic(mut self, key: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.semantic_context.insert(key.into(), value.into());
        self
    }

    /// Swap edges so `long_edge >= short_edge`
    pub fn normalized(mut self) -> Self {
        if self.long_edge < self.short_edge {
            std::mem::swap(&mut self.long_edge, &mut self.short_edge);
        }
        self
    }

    /// Check geometric and envelope bounds
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.building_id.as_str().is_empty() {
            return Err("building id is empty".to_string());
        }
        if !(self.long_edge.is_finite() && self.short_edge.is_finite()) {
            return Err("footprint edges must be finite".to_string());
        }
        if self.short_edge.min(self.long_edge) < MIN_EDGE_LENGTH {
            return Err(format!(
                "footprint edge below {} m ({} x {})",
                MIN_EDGE_LENGTH, self.long_edge, self.short_edge
            ));
        }
        if self.num_floors < 1 {
            return Err("building must have at least one floor".to_string());
        }
        if !(self.f2f_height.is_finite() && self.f2f_height >= 0.0) {
            return Err(format!("invalid floor-to-floor height {}", self.f2f_height));
        }
        if !(0.0..=1.0).contains(&self.wwr) {
            return Err(format!("window-to-wall ratio {} outside [0, 1]", self.wwr));
        }
        if !(0.0..=1.0).contains(&self.exposed_basement_frac) {
            return Err(format!(
                "exposed basement fraction {} outside [0, 1]",
                self.exposed_basement_frac
            ));
        }
        Ok(())
    }

    /// Whether the weather reference looks usable
    pub fn weather_is_valid(&self) -> bool {
        let w = self.weather.trim();
        !w.is_empty() && (w.ends_with(".zip") || w.ends_with(".epw"))
    }

    /// Weather file stem, used as a categorical feature
    pub fn weather_stem(&self) -> &str {
        let name = self.weather.rsplit('/').next().unwrap_or(&self.weather);
        name.split('.').next().unwrap_or(name)
    }

    /// Total building height [m]
    pub fn height(&self) -> f64 {
        self.num_floors as f64 * self.f2f_height
    }

    /// Aspect ratio of the footprint
    pub fn aspect_ratio(&self) -> f64 {
        self.long_edge / self.short_edge
    }

    /// Zoning layout
    pub fn zoning(&self) -> Zoning {
        if self.long_edge > CORE_PERIMETER_EDGE && self.short_edge > CORE_PERIMETER_EDGE {
            Zoning::CorePerimeter
        } else {
            Zoning::ByStorey
        }
    }

    /// Footprint area [m²]
    pub fn footprint_area(&self) -> f64 {
        self.long_edge * self.short_edge
    }

    /// Floors counted as conditioned, including basement/attic
    pub fn conditioned_floors(&self) -> u32 {
        self.num_floors
            + u32::from(self.basement.is_conditioned())
            + u32::from(self.attic.is_conditioned())
    }

    /// Floors counted as occupied, including basement/attic
    pub fn occupied_floors(&self) -> u32 {
        self.num_floors
            + u32::from(self.basement.is_occupied())
            + u32::from(self.attic.is_occupied())
    }

    /// Conditioned floor area [m²]
    pub fn conditioned_area(&self) -> f64 {
        self.conditioned_floors() as f64 * self.footprint_area()
    }

    /// Occupied floor area [m²]
    pub fn occupied_area(&self) -> f64 {
        self.occupied_floors() as f64 * self.footprint_area()
    }

    /// Deterministic feature map used as the dataframe row index
    pub fn features(&self) -> BTreeMap<String, FeatureValue> {
        let yes_no = |b: bool| FeatureValue::from(if b { "Yes" } else { "No" });
        let mut features = BTreeMap::new();
        let mut put = |k: &str, v: FeatureValue| {
            features.insert(k.to_string(), v);
        };

        put("feature.geometry.long_edge", self.long_edge.into());
        put("feature.geometry.short_edge", self.short_edge.into());
        put("feature.geometry.orientation", self.long_edge_angle.into());
        put("feature.geometry.orientation.cos", self.long_edge_angle.cos().into());
        put("feature.geometry.orientation.sin", self.long_edge_angle.sin().into());
        put("feature.geometry.aspect_ratio", self.aspect_ratio().into());
        put("feature.geometry.wwr", self.wwr.into());
        put("feature.geometry.num_floors", i64::from(self.num_floors).into());
        put("feature.geometry.f2f_height", self.f2f_height.into());
        put("feature.geometry.zoning", FeatureValue::Text(self.zoning().to_string()));
        put(
            "feature.geometry.energy_model_conditioned_area",
            self.conditioned_area().into(),
        );
        put(
            "feature.geometry.energy_model_occupied_area",
            self.occupied_area().into(),
        );
        put(
            "feature.geometry.exposed_basement_frac",
            self.exposed_basement_frac.into(),
        );
        put("feature.weather.file", self.weather_stem().into());
        put("feature.extra_spaces.basement.exists", yes_no(self.basement.exists()));
        put("feature.extra_spaces.basement.occupied", yes_no(self.basement.is_occupied()));
        put(
            "feature.extra_spaces.basement.conditioned",
            yes_no(self.basement.is_conditioned()),
        );
        put("feature.extra_spaces.attic.exists", yes_no(self.attic.exists()));
        put("feature.extra_spaces.attic.occupied", yes_no(self.attic.is_occupied()));
        put("feature.extra_spaces.attic.conditioned", yes_no(self.attic.is_conditioned()));

        for (k, v) in &self.semantic_context {
            features.insert(format!("feature.semantic.{}", k), v.clone());
        }
        features
    }
}

/// How hourly results leave the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HourlyOutputMode {
    /// Emit hourly rows in the partial result and keep raw files
    #[default]
    DataframesAndFilerefs,
    /// Keep raw files only
    FilerefOnly,
    /// Emit hourly rows only
    DataframesOnly,
}

impl HourlyOutputMode {
    /// Whether hourly rows go into the result dataframes
    pub fn emits_dataframes(self) -> bool {
        matches!(self, Self::DataframesAndFilerefs | Self::DataframesOnly)
    }

    /// Whether raw hourly files are retained by the worker
    pub fn emits_files(self) -> bool {
        matches!(self, Self::DataframesAndFilerefs | Self::FilerefOnly)
    }
}

/// Hourly capture configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HourlyDataConfig {
    /// Hourly variables to report
    #[serde(default)]
    pub data: Vec<String>,
    /// Output mode
    #[serde(default)]
    pub output_mode: HourlyOutputMode,
}

impl HourlyDataConfig {
    /// Whether any hourly capture was requested
    pub fn is_requested(&self) -> bool {
        !self.data.is_empty()
    }
}

/// Experiment manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    /// Experiment name, first segment(s) of the run name
    pub name: String,
    /// Scenario identifier
    pub scenario: String,
    /// Hourly capture, absent when only summaries are wanted
    #[serde(default)]
    pub hourly_data_config: Option<HourlyDataConfig>,
    /// Building specs, produced by the upstream spec-generation stage
    #[serde(default)]
    pub buildings: Vec<BuildingSpec>,
}

impl ExperimentSpec {
    /// Parse a YAML manifest
    pub fn from_yaml(text: &str) -> Result<Self> {
        let spec: Self = serde_yaml::from_str(text)?;
        if spec.name.trim().is_empty() {
            return Err(FanoutError::config("manifest name must not be empty"));
        }
        Ok(spec)
    }

    /// Load a YAML manifest from disk
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Override the scenario
    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = scenario.into();
        self
    }

    /// Run name `{name}/{scenario}`
    pub fn run_name(&self) -> Result<RunName> {
        RunName::new(format!("{}/{}", self.name, self.scenario))
    }

    /// Hourly configuration, defaulting to no capture
    pub fn hourly(&self) -> HourlyDataConfig {
        self.hourly_data_config.clone().unwrap_or_default()
    }
}
