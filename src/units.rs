use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Metres in one international foot
pub const FOOT_IN_METRES: f64 = 0.3048;

/// Unit conversions applied to raw survey data before estimation.
///
/// Site areas are stored in square units and their variances in units to the fourth power, so a
/// conversion with linear factor $k$ scales lengths by $k$, areas by $k^2$ and area variances by
/// $k^4$. All estimates are produced in metres.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Conversion {
    /// Square feet to square metres
    #[serde(rename = "sf2m")]
    SquareFeetToMeters,
}

impl Conversion {
    /// The linear scale factor of the conversion
    #[must_use]
    pub const fn length_factor(self) -> f64 {
        match self {
            Self::SquareFeetToMeters => FOOT_IN_METRES,
        }
    }

    #[must_use]
    pub fn area_factor(self) -> f64 {
        self.length_factor().powi(2)
    }

    #[must_use]
    pub fn area_variance_factor(self) -> f64 {
        self.area_factor().powi(2)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::SquareFeetToMeters => "sf2m",
        }
    }

    #[must_use]
    pub fn convert_length(self, length: f64) -> f64 {
        length * self.length_factor()
    }

    #[must_use]
    pub fn convert_area(self, area: f64) -> f64 {
        area * self.area_factor()
    }

    #[must_use]
    pub fn convert_area_variance(self, variance: f64) -> f64 {
        variance * self.area_variance_factor()
    }

    #[must_use]
    pub fn revert_length(self, length: f64) -> f64 {
        length / self.length_factor()
    }

    #[must_use]
    pub fn revert_area(self, area: f64) -> f64 {
        area / self.area_factor()
    }

    #[must_use]
    pub fn revert_area_variance(self, variance: f64) -> f64 {
        variance / self.area_variance_factor()
    }

    /// The conversion needed to bring geometry measured in `linear_units` into metres
    ///
    /// # Errors
    /// Returns [`Error::InvalidConversion`] when no conversion from `linear_units` exists.
    pub fn for_linear_units(linear_units: &str) -> Result<Option<Self>> {
        match linear_units.trim().to_ascii_lowercase().as_str() {
            "meter" | "meters" | "metre" | "metres" => Ok(None),
            "foot" | "feet" | "foot_us" | "foot_international" => {
                Ok(Some(Self::SquareFeetToMeters))
            }
            _ => Err(Error::InvalidConversion(linear_units.to_owned())),
        }
    }
}

impl fmt::Display for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Conversion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sf2m" => Ok(Self::SquareFeetToMeters),
            other => Err(Error::InvalidConversion(other.to_owned())),
        }
    }
}
