use serde::{Deserialize, Serialize};

use crate::units::Conversion;
use crate::{Error, Result};

/// A raw site record as delivered by the data source, before unit conversion
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteRow {
    pub id: String,
    pub area: f64,
    pub variance: f64,
    #[serde(default)]
    pub sample_area: Option<f64>,
}

impl SiteRow {
    pub fn new(id: impl Into<String>, area: f64, variance: f64) -> Self {
        Self {
            id: id.into(),
            area,
            variance,
            sample_area: None,
        }
    }

    #[must_use]
    pub fn with_sample_area(mut self, sample_area: f64) -> Self {
        self.sample_area = Some(sample_area);
        self
    }
}

/// The eelgrass measurements for a single sampled site.
///
/// Areas are square metres and variances metres to the fourth power once the site is built.
#[derive(Clone, Debug, PartialEq)]
pub struct Site {
    id: String,
    area: f64,
    variance: f64,
    /// Sample area of the site polygon, only carried by rotational flats sites
    sample_area: Option<f64>,
}

impl Site {
    /// Build a site, applying `conversion` to its measurements exactly once
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if `variance` is negative or not a number.
    pub fn new(
        id: impl Into<String>,
        area: f64,
        variance: f64,
        sample_area: Option<f64>,
        conversion: Option<Conversion>,
    ) -> Result<Self> {
        let id = id.into();
        if variance.is_nan() || variance < 0.0 {
            return Err(Error::InvalidParameter {
                name: "variance",
                value: variance.to_string(),
                reason: format!("site `{id}` must have a non-negative area variance"),
            });
        }

        let site = Self {
            id,
            area,
            variance,
            sample_area,
        };

        Ok(match conversion {
            Some(conversion) => site.converted(conversion),
            None => site,
        })
    }

    /// # Errors
    /// See [`Site::new`].
    pub fn from_row(row: SiteRow, conversion: Option<Conversion>) -> Result<Self> {
        Self::new(row.id, row.area, row.variance, row.sample_area, conversion)
    }

    fn converted(self, conversion: Conversion) -> Self {
        Self {
            id: self.id,
            area: conversion.convert_area(self.area),
            variance: conversion.convert_area_variance(self.variance),
            sample_area: self.sample_area.map(|a| conversion.convert_area(a)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn area(&self) -> f64 {
        self.area
    }

    pub const fn variance(&self) -> f64 {
        self.variance
    }

    pub const fn sample_area(&self) -> Option<f64> {
        self.sample_area
    }

    #[must_use]
    pub fn standard_error(&self) -> f64 {
        self.variance.sqrt()
    }

    /// An independent copy of the site with its area shifted by `z` standard errors.
    ///
    /// Areas cannot be negative, so the shifted area is clamped at zero.
    #[must_use]
    pub fn perturbed(&self, z: f64) -> Self {
        let area = z.mul_add(self.standard_error(), self.area).max(0.0);
        Self {
            area,
            ..self.clone()
        }
    }
}
