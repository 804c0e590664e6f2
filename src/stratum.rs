use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::source::FeatureSummary;
use crate::units::Conversion;
use crate::{Error, Result};

/// Length of shoreline represented by each sampling unit of the fringe frame, in metres
pub const FRINGE_UNIT_LENGTH: f64 = 1000.0;

/// The stratum a site is reported under
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStratum {
    Core,
    #[serde(rename = "persistent flats")]
    PersistentFlats,
    Flats,
    Fringe,
    #[serde(rename = "wide fringe")]
    WideFringe,
}

impl AnalysisStratum {
    pub const ALL: [Self; 5] = [
        Self::Core,
        Self::PersistentFlats,
        Self::Flats,
        Self::Fringe,
        Self::WideFringe,
    ];

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::PersistentFlats => "persistent flats",
            Self::Flats => "flats",
            Self::Fringe => "fringe",
            Self::WideFringe => "wide fringe",
        }
    }

    /// The extrapolation the sampling design prescribes for the stratum
    #[must_use]
    pub const fn extrapolation(self) -> Extrapolation {
        match self {
            Self::Core | Self::PersistentFlats => Extrapolation::None,
            Self::Flats => Extrapolation::Area,
            Self::Fringe | Self::WideFringe => Extrapolation::Linear,
        }
    }
}

impl fmt::Display for AnalysisStratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AnalysisStratum {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|stratum| stratum.label() == s)
            .ok_or_else(|| Error::InvalidStratumKind {
                stratum: s.to_owned(),
                expected: "known",
            })
    }
}

/// How a sample's measured area is scaled up to its stratum
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Extrapolation {
    /// Every site in the stratum is sampled
    None,
    /// Ratio of site area to sampled area, scaled by the stratum area
    Area,
    /// Mean site area per unit of shoreline, scaled by the stratum length
    Linear,
}

impl Extrapolation {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Area => "area",
            Self::Linear => "linear",
        }
    }
}

impl fmt::Display for Extrapolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Population constants of a stratum, derived from the sampling frame geometry
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PopulationConstants {
    None,
    Area {
        /// Count of sites in the stratum, $N_i$
        population_count: usize,
        /// Total stratum area in square metres, $A_2$
        population_area: f64,
    },
    Linear {
        /// Count of sites in the stratum, $N_i$
        population_count: usize,
        /// Total stratum shoreline length in metres, $L_T$
        population_length: f64,
        /// Length of the sampling frame in metres, $L_N = N_i \times 1000$
        normalizing_length: f64,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stratum {
    analysis: AnalysisStratum,
    constants: PopulationConstants,
}

impl Stratum {
    /// A stratum where all sites are sampled and no extrapolation takes place
    ///
    /// # Errors
    /// Returns [`Error::InvalidStratumKind`] unless `analysis` is core or persistent flats.
    pub fn unextrapolated(analysis: AnalysisStratum) -> Result<Self> {
        match analysis.extrapolation() {
            Extrapolation::None => Ok(Self {
                analysis,
                constants: PopulationConstants::None,
            }),
            _ => Err(Error::InvalidStratumKind {
                stratum: analysis.label().to_owned(),
                expected: "non-extrapolated",
            }),
        }
    }

    /// The rotational flats stratum, with `population_area` in square metres
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if the stratum has no sites.
    pub fn flats(population_count: usize, population_area: f64) -> Result<Self> {
        check_population(AnalysisStratum::Flats, population_count)?;
        Ok(Self {
            analysis: AnalysisStratum::Flats,
            constants: PopulationConstants::Area {
                population_count,
                population_area,
            },
        })
    }

    /// A fringe or wide fringe stratum, with `population_length` in metres
    ///
    /// # Errors
    /// Returns [`Error::InvalidStratumKind`] unless `analysis` is fringe or wide fringe, and
    /// [`Error::InvalidParameter`] if the stratum has no sites.
    #[allow(clippy::cast_precision_loss)]
    pub fn fringe(
        analysis: AnalysisStratum,
        population_count: usize,
        population_length: f64,
    ) -> Result<Self> {
        if analysis.extrapolation() != Extrapolation::Linear {
            return Err(Error::InvalidStratumKind {
                stratum: analysis.label().to_owned(),
                expected: "fringe",
            });
        }
        check_population(analysis, population_count)?;

        Ok(Self {
            analysis,
            constants: PopulationConstants::Linear {
                population_count,
                population_length,
                normalizing_length: population_count as f64 * FRINGE_UNIT_LENGTH,
            },
        })
    }

    /// Build a stratum from the aggregates of the sampling frame feature class.
    ///
    /// `population` supplies the site count $N_i$. For flats `extent` supplies the summed polygon
    /// area, for fringe strata the summed shoreline length (which may include orphan segments
    /// not counted in $N_i$). Geometry is converted to metres with `conversion`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidStratumKind`] for strata without population constants.
    pub fn from_features(
        analysis: AnalysisStratum,
        population: &FeatureSummary,
        extent: &FeatureSummary,
        conversion: Option<Conversion>,
    ) -> Result<Self> {
        check_linear_units(analysis, &extent.linear_units, conversion);
        match analysis.extrapolation() {
            Extrapolation::None => Err(Error::InvalidStratumKind {
                stratum: analysis.label().to_owned(),
                expected: "extrapolated",
            }),
            Extrapolation::Area => {
                let area = conversion.map_or(extent.geometry_sum, |c| {
                    c.convert_area(extent.geometry_sum)
                });
                Self::flats(population.record_count, area)
            }
            Extrapolation::Linear => {
                let length = conversion.map_or(extent.geometry_sum, |c| {
                    c.convert_length(extent.geometry_sum)
                });
                Self::fringe(analysis, population.record_count, length)
            }
        }
    }

    pub const fn analysis(&self) -> AnalysisStratum {
        self.analysis
    }

    pub const fn extrapolation(&self) -> Extrapolation {
        self.analysis.extrapolation()
    }

    pub const fn constants(&self) -> &PopulationConstants {
        &self.constants
    }

    pub const fn population_count(&self) -> Option<usize> {
        match self.constants {
            PopulationConstants::None => None,
            PopulationConstants::Area {
                population_count, ..
            }
            | PopulationConstants::Linear {
                population_count, ..
            } => Some(population_count),
        }
    }
}

fn check_population(analysis: AnalysisStratum, population_count: usize) -> Result<()> {
    if population_count == 0 {
        return Err(Error::InvalidParameter {
            name: "population_count",
            value: population_count.to_string(),
            reason: format!("the {analysis} stratum must contain at least one site"),
        });
    }
    Ok(())
}

fn check_linear_units(
    analysis: AnalysisStratum,
    linear_units: &str,
    conversion: Option<Conversion>,
) {
    match Conversion::for_linear_units(linear_units) {
        Ok(expected) if expected == conversion => {}
        Ok(expected) => warn!(
            stratum = %analysis,
            linear_units,
            requested = ?conversion,
            expected = ?expected,
            "feature class units disagree with the requested conversion"
        ),
        Err(_) => warn!(
            stratum = %analysis,
            linear_units,
            "feature class linear units are not recognised"
        ),
    }
}

/// Lookup from geomorphic and sampling strata to the analysis stratum
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StratumScheme {
    /// Persistent flats are reported separately from core sites
    AreaEstimate,
    /// Persistent flats are reported together with core sites
    ChangeAnalysis,
}

impl StratumScheme {
    /// The analysis strata the scheme reports, in report order
    #[must_use]
    pub fn strata(self) -> &'static [AnalysisStratum] {
        match self {
            Self::AreaEstimate => &AnalysisStratum::ALL,
            Self::ChangeAnalysis => &[
                AnalysisStratum::Core,
                AnalysisStratum::Flats,
                AnalysisStratum::Fringe,
                AnalysisStratum::WideFringe,
            ],
        }
    }

    /// # Errors
    /// Returns [`Error::UnknownStratumCombination`] if the pair is not part of the design.
    pub fn classify(self, geo: &str, sampling: &str) -> Result<AnalysisStratum> {
        let stratum = match (geo, sampling) {
            ("frw" | "fr" | "fl", "core") => AnalysisStratum::Core,
            ("fl", "persistent") => match self {
                Self::AreaEstimate => AnalysisStratum::PersistentFlats,
                Self::ChangeAnalysis => AnalysisStratum::Core,
            },
            ("fl", "rotational") => AnalysisStratum::Flats,
            ("fr", "rotational") => AnalysisStratum::Fringe,
            ("frw", "rotational") => AnalysisStratum::WideFringe,
            _ => {
                return Err(Error::UnknownStratumCombination {
                    geo: geo.to_owned(),
                    sampling: sampling.to_owned(),
                })
            }
        };
        Ok(stratum)
    }
}

#[cfg(test)]
mod tests {
    use super::{AnalysisStratum, Extrapolation, PopulationConstants, Stratum, StratumScheme};
    use crate::source::FeatureSummary;
    use crate::units::{Conversion, FOOT_IN_METRES};
    use crate::Error;

    #[test]
    fn labels_round_trip() {
        for stratum in AnalysisStratum::ALL {
            assert_eq!(stratum.label().parse::<AnalysisStratum>().unwrap(), stratum);
        }
        assert!("eelgrass".parse::<AnalysisStratum>().is_err());
    }

    #[test]
    fn fringe_strata_normalise_by_one_kilometre_per_site() {
        let stratum = Stratum::fringe(AnalysisStratum::WideFringe, 42, 51_000.0).unwrap();
        assert_eq!(stratum.extrapolation(), Extrapolation::Linear);
        assert_eq!(stratum.population_count(), Some(42));
        match stratum.constants() {
            PopulationConstants::Linear {
                population_length,
                normalizing_length,
                ..
            } => {
                approx::assert_relative_eq!(*population_length, 51_000.0);
                approx::assert_relative_eq!(*normalizing_length, 42_000.0);
            }
            other => panic!("unexpected constants {other:?}"),
        }
    }

    #[test]
    fn fringe_rejects_other_strata() {
        for analysis in [
            AnalysisStratum::Core,
            AnalysisStratum::PersistentFlats,
            AnalysisStratum::Flats,
        ] {
            assert!(matches!(
                Stratum::fringe(analysis, 10, 100.0),
                Err(Error::InvalidStratumKind { .. })
            ));
        }
    }

    #[test]
    fn empty_populations_are_rejected() {
        assert!(matches!(
            Stratum::flats(0, 1000.0),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(Stratum::fringe(AnalysisStratum::Fringe, 0, 1000.0).is_err());
    }

    #[test]
    fn unextrapolated_rejects_extrapolated_strata() {
        assert!(Stratum::unextrapolated(AnalysisStratum::Core).is_ok());
        assert!(Stratum::unextrapolated(AnalysisStratum::PersistentFlats).is_ok());
        assert!(Stratum::unextrapolated(AnalysisStratum::Flats).is_err());
        assert!(Stratum::unextrapolated(AnalysisStratum::Fringe).is_err());
    }

    #[test]
    fn feature_aggregates_are_converted_to_metres() {
        let population = FeatureSummary {
            record_count: 12,
            geometry_sum: 0.0,
            linear_units: "Foot_US".into(),
        };
        let extent = FeatureSummary {
            record_count: 14,
            geometry_sum: 10_000.0,
            linear_units: "Foot_US".into(),
        };
        let conversion = Some(Conversion::SquareFeetToMeters);

        let flats =
            Stratum::from_features(AnalysisStratum::Flats, &population, &extent, conversion)
                .unwrap();
        assert_eq!(
            flats.constants(),
            &PopulationConstants::Area {
                population_count: 12,
                population_area: 10_000.0 * FOOT_IN_METRES.powi(2),
            }
        );

        let fringe =
            Stratum::from_features(AnalysisStratum::Fringe, &population, &extent, conversion)
                .unwrap();
        match fringe.constants() {
            PopulationConstants::Linear {
                population_count,
                population_length,
                normalizing_length,
            } => {
                assert_eq!(*population_count, 12);
                approx::assert_relative_eq!(*population_length, 10_000.0 * FOOT_IN_METRES);
                approx::assert_relative_eq!(*normalizing_length, 12_000.0);
            }
            other => panic!("unexpected constants {other:?}"),
        }

        assert!(Stratum::from_features(AnalysisStratum::Core, &population, &extent, None).is_err());
    }

    #[test]
    fn persistent_flats_join_core_for_change_analysis() {
        assert_eq!(
            StratumScheme::AreaEstimate.classify("fl", "persistent").unwrap(),
            AnalysisStratum::PersistentFlats
        );
        assert_eq!(
            StratumScheme::ChangeAnalysis
                .classify("fl", "persistent")
                .unwrap(),
            AnalysisStratum::Core
        );
        for scheme in [StratumScheme::AreaEstimate, StratumScheme::ChangeAnalysis] {
            assert_eq!(scheme.classify("frw", "core").unwrap(), AnalysisStratum::Core);
            assert_eq!(
                scheme.classify("fl", "rotational").unwrap(),
                AnalysisStratum::Flats
            );
            assert_eq!(
                scheme.classify("fr", "rotational").unwrap(),
                AnalysisStratum::Fringe
            );
            assert_eq!(
                scheme.classify("frw", "rotational").unwrap(),
                AnalysisStratum::WideFringe
            );
            assert!(matches!(
                scheme.classify("fr", "persistent"),
                Err(Error::UnknownStratumCombination { .. })
            ));
        }
    }
}
