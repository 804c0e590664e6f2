use std::sync::Arc;

use ndarray::Array1;
use tracing::debug;

use crate::estimate::AreaEstimate;
use crate::site::{Site, SiteRow};
use crate::stratum::{AnalysisStratum, PopulationConstants, Stratum};
use crate::units::Conversion;
use crate::{Error, Result};

/// Terms of the ratio estimator used for rotational flats
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ratio {
    /// Summed sample area of the sampled sites, $A_{ij}$
    pub total_sample_area: f64,
    /// Eelgrass area per unit of sampled area, $R$
    pub ratio: f64,
}

/// A set of sites sampled from one stratum, with the stratum-level estimate derived from them.
///
/// Everything is computed once on construction; a sample is immutable afterwards.
#[derive(Clone, Debug)]
pub struct Sample {
    stratum: Arc<Stratum>,
    sites: Vec<Site>,
    areas: Array1<f64>,
    variances: Array1<f64>,
    mean_area: f64,
    /// Unbiased variance of the site areas
    sample_variance: f64,
    ratio: Option<Ratio>,
    area: f64,
    variance: f64,
}

impl Sample {
    /// Estimate the stratum area from already-converted `sites`.
    ///
    /// # Errors
    /// - [`Error::EmptySample`] if `sites` is empty
    /// - [`Error::InsufficientSites`] if an extrapolated stratum has fewer than two sites
    /// - [`Error::MissingSampleArea`] if a rotational flats site has no sample area
    /// - [`Error::ZeroSampleArea`] if the rotational flats sample areas sum to zero
    pub fn new(sites: Vec<Site>, stratum: Arc<Stratum>) -> Result<Self> {
        let analysis = stratum.analysis();
        if sites.is_empty() {
            return Err(Error::EmptySample {
                stratum: analysis.label().to_owned(),
            });
        }
        if !matches!(stratum.constants(), PopulationConstants::None) && sites.len() < 2 {
            return Err(Error::InsufficientSites {
                stratum: analysis.label().to_owned(),
                extrapolation: stratum.extrapolation().label().to_owned(),
                required: 2,
                found: sites.len(),
            });
        }

        let areas: Array1<f64> = sites.iter().map(Site::area).collect();
        let variances: Array1<f64> = sites.iter().map(Site::variance).collect();
        let mean_area = areas.mean().unwrap_or_default();
        let sample_variance = if sites.len() > 1 { areas.var(1.0) } else { 0.0 };

        let (ratio, area, variance) = match *stratum.constants() {
            PopulationConstants::None => (None, areas.sum(), variances.sum()),
            PopulationConstants::Area {
                population_count,
                population_area,
            } => {
                let sample_areas = sample_areas(&sites, analysis)?;
                let estimate = RatioEstimate {
                    areas: &areas,
                    variances: &variances,
                    sample_areas: &sample_areas,
                    population_count,
                    population_area,
                };
                let ratio = estimate.ratio(analysis)?;
                (
                    Some(ratio),
                    estimate.area(&ratio),
                    estimate.variance(&ratio),
                )
            }
            PopulationConstants::Linear {
                population_count,
                population_length,
                normalizing_length,
            } => {
                let estimate = LinearEstimate {
                    scale: population_length / normalizing_length,
                    mean_area,
                    sample_variance,
                    total_variance: variances.sum(),
                    sample_size: sites.len(),
                    population_count,
                };
                (None, estimate.area(), estimate.variance())
            }
        };

        debug!(
            stratum = %analysis,
            sites = sites.len(),
            mean_area,
            sample_variance,
            area,
            variance,
            "estimated stratum area"
        );

        Ok(Self {
            stratum,
            sites,
            areas,
            variances,
            mean_area,
            sample_variance,
            ratio,
            area,
            variance,
        })
    }

    /// Build the sites from raw rows, converting every one of them with `conversion`
    ///
    /// # Errors
    /// See [`Site::new`] and [`Sample::new`].
    pub fn from_rows(
        rows: impl IntoIterator<Item = SiteRow>,
        stratum: Arc<Stratum>,
        conversion: Option<Conversion>,
    ) -> Result<Self> {
        let sites = rows
            .into_iter()
            .map(|row| Site::from_row(row, conversion))
            .collect::<Result<Vec<_>>>()?;
        Self::new(sites, stratum)
    }

    pub fn stratum(&self) -> &Stratum {
        &self.stratum
    }

    /// The shared handle to the stratum, for building further samples of the same stratum
    pub const fn stratum_handle(&self) -> &Arc<Stratum> {
        &self.stratum
    }

    pub fn analysis(&self) -> AnalysisStratum {
        self.stratum.analysis()
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn site_ids(&self) -> impl Iterator<Item = &str> {
        self.sites.iter().map(Site::id)
    }

    /// Number of sites in the sample, $n_i$
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Always false, a sample cannot be built without sites
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub const fn areas(&self) -> &Array1<f64> {
        &self.areas
    }

    pub const fn variances(&self) -> &Array1<f64> {
        &self.variances
    }

    pub const fn mean_area(&self) -> f64 {
        self.mean_area
    }

    /// Unbiased variance of the site areas, zero for a single site
    pub const fn sample_variance(&self) -> f64 {
        self.sample_variance
    }

    /// Summed sample area $A_{ij}$, only for area extrapolation
    pub fn total_sample_area(&self) -> Option<f64> {
        self.ratio.map(|r| r.total_sample_area)
    }

    /// Ratio $R$ of eelgrass area to sampled area, only for area extrapolation
    pub fn ratio(&self) -> Option<f64> {
        self.ratio.map(|r| r.ratio)
    }
}

impl AreaEstimate for Sample {
    fn area(&self) -> f64 {
        self.area
    }

    fn variance(&self) -> f64 {
        self.variance
    }
}

fn sample_areas(sites: &[Site], analysis: AnalysisStratum) -> Result<Array1<f64>> {
    sites
        .iter()
        .map(|site| {
            site.sample_area().ok_or_else(|| Error::MissingSampleArea {
                stratum: analysis.label().to_owned(),
                site: site.id().to_owned(),
            })
        })
        .collect()
}

/// Ratio estimator for rotational flats (Skalski 2003, Appendix L, equations 9 and 11)
struct RatioEstimate<'a> {
    areas: &'a Array1<f64>,
    variances: &'a Array1<f64>,
    sample_areas: &'a Array1<f64>,
    population_count: usize,
    population_area: f64,
}

impl RatioEstimate<'_> {
    #[allow(clippy::float_cmp)]
    fn ratio(&self, analysis: AnalysisStratum) -> Result<Ratio> {
        let total_sample_area = self.sample_areas.sum();
        if total_sample_area == 0.0 {
            return Err(Error::ZeroSampleArea {
                stratum: analysis.label().to_owned(),
            });
        }
        Ok(Ratio {
            total_sample_area,
            ratio: self.areas.sum() / total_sample_area,
        })
    }

    fn area(&self, ratio: &Ratio) -> f64 {
        self.areas.sum() * self.population_area / ratio.total_sample_area
    }

    #[allow(clippy::cast_precision_loss)]
    fn variance(&self, ratio: &Ratio) -> f64 {
        let n = self.areas.len() as f64;
        let population = self.population_count as f64;

        let residuals = (self.areas - &(self.sample_areas * ratio.ratio))
            .mapv(|residual| residual.powi(2))
            .sum();

        let sampling = population.powi(2) * (1.0 - n / population) * residuals / (n * (n - 1.0));
        let measurement = population * self.variances.sum() / n;

        sampling + measurement
    }
}

/// Mean-per-unit-length estimator for fringe strata (Skalski 2003, Appendix L, equations 7 and 8)
struct LinearEstimate {
    /// $L_T / L_N$
    scale: f64,
    mean_area: f64,
    sample_variance: f64,
    total_variance: f64,
    sample_size: usize,
    population_count: usize,
}

impl LinearEstimate {
    #[allow(clippy::cast_precision_loss)]
    fn area(&self) -> f64 {
        self.scale * self.mean_area * self.population_count as f64
    }

    #[allow(clippy::cast_precision_loss)]
    fn variance(&self) -> f64 {
        let n = self.sample_size as f64;
        let population = self.population_count as f64;

        let sampling = population.powi(2) * (1.0 - n / population) * self.sample_variance / n;
        let measurement = (population / n) * self.total_variance;

        self.scale.powi(2) * (sampling + measurement)
    }
}
