use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::units::Conversion;
use crate::{Error, Result};

/// A complete run configuration, usually read from a TOML file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub survey: SurveyConfig,
    pub layers: LayerConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurveyConfig {
    /// The survey year, or Year 1 of a change analysis
    pub year: i32,
    /// Year 2 of a change analysis
    #[serde(default)]
    pub comparison_year: Option<i32>,
    #[serde(default = "default_sample_group")]
    pub sample_group: String,
    /// Conversion applied to site data and frame geometry, `None` when already in metres
    #[serde(default)]
    pub conversion: Option<Conversion>,
}

/// Names of the tables and feature classes in the data source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub site_table: String,
    pub all_sites: String,
    pub flats: String,
    pub fringe: String,
    /// Field of the flats feature class holding each polygon's area
    #[serde(default = "default_sample_area_field")]
    pub sample_area_field: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub iterations: usize,
    pub seed: u64,
    /// Iterations drawn from one random stream, the unit of parallel work
    pub batch_size: usize,
    pub confidence: f64,
    /// Keep a trace of every simulated site
    pub record_sites: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            iterations: 20_000,
            seed: 40,
            batch_size: 1_000,
            confidence: 0.95,
            record_sites: false,
        }
    }
}

impl SimulationConfig {
    /// # Errors
    /// Returns [`Error::InvalidParameter`] for an empty run or a confidence level outside (0, 1).
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(Error::InvalidParameter {
                name: "iterations",
                value: self.iterations.to_string(),
                reason: "the simulation needs at least one iteration".into(),
            });
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidParameter {
                name: "batch_size",
                value: self.batch_size.to_string(),
                reason: "batches need at least one iteration".into(),
            });
        }
        check_confidence(self.confidence)
    }
}

pub(crate) fn check_confidence(level: f64) -> Result<()> {
    if level > 0.0 && level < 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name: "confidence",
            value: level.to_string(),
            reason: "confidence level must lie strictly between 0 and 1".into(),
        })
    }
}

fn default_sample_group() -> String {
    "soundwide".into()
}

fn default_sample_area_field() -> String {
    "SHAPE_AREA".into()
}

impl Config {
    /// # Errors
    /// Fails if the file cannot be read, is not valid TOML or does not validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        fs::read_to_string(path)?.parse()
    }

    /// # Errors
    /// See [`SimulationConfig::validate`].
    pub fn validate(&self) -> Result<()> {
        self.simulation.validate()
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, SimulationConfig};
    use crate::units::Conversion;
    use crate::Error;

    const MINIMAL: &str = r#"
        [survey]
        year = 2007

        [layers]
        site_table = "all_years_sites"
        all_sites = "svmp_all_sites"
        flats = "flats"
        fringe = "fringe"
    "#;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = MINIMAL.parse().unwrap();
        assert_eq!(config.survey.year, 2007);
        assert_eq!(config.survey.comparison_year, None);
        assert_eq!(config.survey.sample_group, "soundwide");
        assert_eq!(config.survey.conversion, None);
        assert_eq!(config.simulation, SimulationConfig::default());
        assert_eq!(config.simulation.iterations, 20_000);
        assert_eq!(config.layers.sample_area_field, "SHAPE_AREA");
    }

    #[test]
    fn full_configuration_parses() {
        let config: Config = r#"
            [survey]
            year = 2007
            comparison_year = 2008
            conversion = "sf2m"

            [layers]
            site_table = "all_years_sites"
            all_sites = "svmp_all_sites"
            flats = "flats"
            fringe = "fringe"

            [simulation]
            iterations = 500
            confidence = 0.9
            record_sites = true
        "#
        .parse()
        .unwrap();

        assert_eq!(config.survey.comparison_year, Some(2008));
        assert_eq!(config.survey.conversion, Some(Conversion::SquareFeetToMeters));
        assert_eq!(config.simulation.iterations, 500);
        assert_eq!(config.simulation.seed, 40);
        assert!(config.simulation.record_sites);
    }

    #[test]
    fn invalid_simulation_settings_are_rejected() {
        for (setting, name) in [
            ("confidence = 1.0", "confidence"),
            ("confidence = 0.0", "confidence"),
            ("iterations = 0", "iterations"),
            ("batch_size = 0", "batch_size"),
        ] {
            let toml = format!("{MINIMAL}\n[simulation]\n{setting}\n");
            match toml.parse::<Config>() {
                Err(Error::InvalidParameter { name: found, .. }) => assert_eq!(found, name),
                other => panic!("expected {name} to be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_conversions_are_configuration_errors() {
        let toml = MINIMAL.replace("year = 2007", "year = 2007\nconversion = \"m2sf\"");
        assert!(matches!(toml.parse::<Config>(), Err(Error::Config(_))));
    }
}
