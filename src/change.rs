//! Year-to-year change in eelgrass area from sites sampled in both years.
//!
//! Within a stratum the Year 2 area of each matched site is regressed on its Year 1 area with a
//! line forced through the origin. The slope $m$ is the ratio of Year 2 to Year 1 area, so the
//! proportion change is $m - 1$ and the area change applies it to the Year 1 estimate for the
//! whole stratum. Standard errors follow the delta method (Skalski 2003).

use itertools::izip;
use tracing::{debug, info, warn};

use crate::estimate::{AnnualEstimate, AreaEstimate};
use crate::sample::Sample;
use crate::stratum::AnalysisStratum;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct ChangeStats {
    analysis: AnalysisStratum,
    matched_sites: usize,
    year1_sites: usize,
    year1_area: f64,
    year1_variance: f64,
    sum_x_squared: f64,
    sum_y_squared: f64,
    sum_xy: f64,
    slope: f64,
    slope_variance: f64,
    proportion_change: f64,
    area_change: f64,
    area_change_variance: f64,
}

impl ChangeStats {
    /// Compare the matched sites of two years within one stratum.
    ///
    /// `year1_matched` and `year2_matched` must hold the same sites in the same order;
    /// `year1` holds every site sampled in the first year and supplies the stratum area the
    /// proportion change is applied to.
    ///
    /// # Errors
    /// - [`Error::StratumMismatch`] if the samples come from different strata
    /// - [`Error::PairingMismatch`] if the matched samples do not pair site for site
    /// - [`Error::InsufficientPairs`] with fewer than two matched sites
    #[allow(clippy::float_cmp, clippy::cast_precision_loss)]
    pub fn new(year1_matched: &Sample, year2_matched: &Sample, year1: &Sample) -> Result<Self> {
        let analysis = year1.analysis();
        for other in [year1_matched.analysis(), year2_matched.analysis()] {
            if other != analysis {
                return Err(Error::StratumMismatch {
                    expected: analysis.label().to_owned(),
                    found: other.label().to_owned(),
                });
            }
        }
        check_pairing(year1_matched, year2_matched)?;

        let n = year1_matched.len();
        if n < 2 {
            return Err(Error::InsufficientPairs {
                stratum: analysis.label().to_owned(),
                found: n,
            });
        }

        let xs = year1_matched.areas();
        let ys = year2_matched.areas();
        let sum_x_squared = xs.dot(xs);
        let sum_y_squared = ys.dot(ys);
        let sum_xy = xs.dot(ys);

        // No matched eelgrass in one of the years leaves the regression undefined
        let (slope, slope_variance) = if sum_xy == 0.0 {
            (0.0, 0.0)
        } else {
            let slope = sum_xy / sum_x_squared;
            let residual = sum_xy.mul_add(-sum_xy / sum_x_squared, sum_y_squared);
            let slope_variance = residual / (n as f64 - 1.0) / sum_x_squared;
            if slope_variance < 0.0 {
                warn!(
                    stratum = %analysis,
                    slope_variance,
                    "negative slope variance from cancellation, using its magnitude"
                );
            }
            (slope, slope_variance.abs())
        };

        let proportion_change = slope - 1.0;
        let year1_area = year1.area();
        let year1_variance = year1.variance();
        let area_change = proportion_change * year1_area;

        let area_change_variance = year1_variance.mul_add(
            proportion_change.powi(2),
            slope_variance.mul_add(year1_area.powi(2), -year1_variance * slope_variance),
        );
        if area_change_variance < 0.0 {
            warn!(
                stratum = %analysis,
                area_change_variance,
                "negative area change variance, using its magnitude"
            );
        }
        let area_change_variance = area_change_variance.abs();

        debug!(
            stratum = %analysis,
            matched_sites = n,
            sum_x_squared,
            sum_y_squared,
            sum_xy,
            slope,
            slope_variance,
            area_change,
            "fitted change regression"
        );

        Ok(Self {
            analysis,
            matched_sites: n,
            year1_sites: year1.len(),
            year1_area,
            year1_variance,
            sum_x_squared,
            sum_y_squared,
            sum_xy,
            slope,
            slope_variance,
            proportion_change,
            area_change,
            area_change_variance,
        })
    }

    pub const fn analysis(&self) -> AnalysisStratum {
        self.analysis
    }

    /// Number of matched site pairs in the regression
    pub const fn matched_sites(&self) -> usize {
        self.matched_sites
    }

    pub const fn year1_sites(&self) -> usize {
        self.year1_sites
    }

    /// Year 1 stratum area estimated from every site sampled that year
    pub const fn year1_area(&self) -> f64 {
        self.year1_area
    }

    pub const fn year1_variance(&self) -> f64 {
        self.year1_variance
    }

    pub const fn sum_x_squared(&self) -> f64 {
        self.sum_x_squared
    }

    pub const fn sum_y_squared(&self) -> f64 {
        self.sum_y_squared
    }

    pub const fn sum_xy(&self) -> f64 {
        self.sum_xy
    }

    pub const fn slope(&self) -> f64 {
        self.slope
    }

    pub const fn slope_variance(&self) -> f64 {
        self.slope_variance
    }

    pub fn slope_standard_error(&self) -> f64 {
        self.slope_variance.sqrt()
    }

    pub const fn proportion_change(&self) -> f64 {
        self.proportion_change
    }

    pub fn percent_change(&self) -> f64 {
        self.proportion_change * 100.0
    }

    pub const fn area_change(&self) -> f64 {
        self.area_change
    }

    pub const fn area_change_variance(&self) -> f64 {
        self.area_change_variance
    }

    pub fn area_change_standard_error(&self) -> f64 {
        self.area_change_variance.sqrt()
    }
}

fn check_pairing(year1: &Sample, year2: &Sample) -> Result<()> {
    let stratum = year1.analysis().label().to_owned();
    if year1.len() != year2.len() {
        return Err(Error::PairingMismatch {
            stratum,
            reason: format!(
                "{} Year 1 sites against {} Year 2 sites",
                year1.len(),
                year2.len()
            ),
        });
    }
    if let Some((row, (first, second))) = year1
        .site_ids()
        .zip(year2.site_ids())
        .enumerate()
        .find(|(_, (first, second))| first != second)
    {
        return Err(Error::PairingMismatch {
            stratum,
            reason: format!("row {row} pairs `{first}` with `{second}`"),
        });
    }
    Ok(())
}

/// Change summed over all strata, with the soundwide proportion change.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeStatsTotal {
    strata: Vec<AnalysisStratum>,
    year1_area: f64,
    area_change: f64,
    area_change_variance: f64,
    proportion_change: f64,
    proportion_change_variance: f64,
}

impl ChangeStatsTotal {
    /// Combine per-stratum change with the Year 1 annual estimate.
    ///
    /// `changes` must follow the strata of `year1_annual` one to one and in the same order.
    ///
    /// # Errors
    /// Returns [`Error::StratumMismatch`] if the strata do not line up.
    #[allow(clippy::float_cmp)]
    pub fn new(changes: &[ChangeStats], year1_annual: &AnnualEstimate<'_>) -> Result<Self> {
        let strata = year1_annual.strata().collect::<Vec<_>>();
        if changes.len() != strata.len() {
            return Err(Error::StratumMismatch {
                expected: format!("{} strata", strata.len()),
                found: format!("{} strata", changes.len()),
            });
        }
        if let Some((expected, change)) = strata
            .iter()
            .zip(changes)
            .find(|(expected, change)| **expected != change.analysis())
        {
            return Err(Error::StratumMismatch {
                expected: expected.label().to_owned(),
                found: change.analysis().label().to_owned(),
            });
        }

        let area_change: f64 = changes.iter().map(ChangeStats::area_change).sum();
        let area_change_variance: f64 = changes.iter().map(ChangeStats::area_change_variance).sum();
        let year1_area = year1_annual.area();

        let (proportion_change, proportion_change_variance) = if year1_area == 0.0 {
            warn!("Year 1 has no eelgrass area, proportion change is reported as zero");
            (0.0, 0.0)
        } else {
            let areas = year1_annual.areas();
            let variances = year1_annual.variances();

            let slope_term: f64 = izip!(changes, &areas)
                .map(|(change, area)| (change.slope_standard_error() * area).powi(2))
                .sum::<f64>()
                / year1_area.powi(2);
            let area_term: f64 = izip!(changes, &variances)
                .map(|(change, variance)| {
                    variance
                        * change
                            .proportion_change()
                            .mul_add(year1_area, -area_change)
                            .powi(2)
                })
                .sum::<f64>()
                / year1_area.powi(4);

            (area_change / year1_area, slope_term + area_term)
        };

        info!(
            strata = strata.len(),
            area_change,
            area_change_se = area_change_variance.sqrt(),
            proportion_change,
            proportion_change_se = proportion_change_variance.sqrt(),
            "estimated total change"
        );

        Ok(Self {
            strata,
            year1_area,
            area_change,
            area_change_variance,
            proportion_change,
            proportion_change_variance,
        })
    }

    pub fn strata(&self) -> &[AnalysisStratum] {
        &self.strata
    }

    pub const fn year1_area(&self) -> f64 {
        self.year1_area
    }

    pub const fn area_change(&self) -> f64 {
        self.area_change
    }

    /// Strata are independent, so standard errors combine as a root sum of squares
    pub fn area_change_standard_error(&self) -> f64 {
        self.area_change_variance.sqrt()
    }

    pub const fn proportion_change(&self) -> f64 {
        self.proportion_change
    }

    pub fn proportion_change_standard_error(&self) -> f64 {
        self.proportion_change_variance.sqrt()
    }

    pub fn percent_change(&self) -> f64 {
        self.proportion_change * 100.0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::{ChangeStats, ChangeStatsTotal};
    use crate::estimate::{AnnualEstimate, AreaEstimate};
    use crate::sample::Sample;
    use crate::site::Site;
    use crate::stratum::{AnalysisStratum, Stratum};
    use crate::Error;

    fn sample_of(analysis: AnalysisStratum, prefix: &str, values: &[(f64, f64)]) -> Sample {
        let sites = values
            .iter()
            .enumerate()
            .map(|(ii, (area, variance))| {
                Site::new(format!("{prefix}{ii}"), *area, *variance, None, None).unwrap()
            })
            .collect();
        Sample::new(sites, Arc::new(Stratum::unextrapolated(analysis).unwrap())).unwrap()
    }

    fn core(values: &[f64]) -> Sample {
        core_with_variance(values, 1.0)
    }

    fn core_with_variance(values: &[f64], variance: f64) -> Sample {
        let values = values.iter().map(|area| (*area, variance)).collect::<Vec<_>>();
        sample_of(AnalysisStratum::Core, "core", &values)
    }

    #[test]
    fn sites_without_eelgrass_give_total_loss() {
        let matched = core(&[0.0, 0.0, 0.0]);
        let change = ChangeStats::new(&matched, &matched, &matched).unwrap();

        assert_eq!(change.slope(), 0.0);
        assert_eq!(change.slope_variance(), 0.0);
        assert_eq!(change.proportion_change(), -1.0);
        assert!(change.area_change_standard_error().is_finite());
    }

    #[test]
    fn identical_years_show_no_change() {
        let year1 = core(&[10.0, 25.0, 40.0, 5.0]);
        let year2 = core(&[10.0, 25.0, 40.0, 5.0]);
        let change = ChangeStats::new(&year1, &year2, &year1).unwrap();

        approx::assert_relative_eq!(change.slope(), 1.0);
        approx::assert_abs_diff_eq!(change.proportion_change(), 0.0);
        approx::assert_abs_diff_eq!(change.area_change(), 0.0);
        approx::assert_abs_diff_eq!(change.slope_standard_error(), 0.0, epsilon = 1e-7);
    }

    #[test]
    fn doubling_applies_to_year1_stratum_area() {
        let year1_matched = core(&[1.0, 2.0, 3.0]);
        let year2_matched = core(&[2.0, 4.0, 6.0]);
        let year1 = core(&[1.0, 2.0, 3.0, 4.0]);

        let change = ChangeStats::new(&year1_matched, &year2_matched, &year1).unwrap();

        approx::assert_relative_eq!(change.sum_x_squared(), 14.0);
        approx::assert_relative_eq!(change.sum_y_squared(), 56.0);
        approx::assert_relative_eq!(change.sum_xy(), 28.0);
        approx::assert_relative_eq!(change.slope(), 2.0);
        approx::assert_relative_eq!(change.proportion_change(), 1.0);
        approx::assert_relative_eq!(change.percent_change(), 100.0);
        approx::assert_relative_eq!(change.area_change(), 10.0);
        approx::assert_relative_eq!(change.area_change_standard_error(), 2.0);
        assert_eq!(change.matched_sites(), 3);
        assert_eq!(change.year1_sites(), 4);
    }

    #[test]
    fn slope_variance_follows_regression_through_origin() {
        let year1 = core(&[1.0, 2.0, 3.0]);
        let year2 = core(&[1.0, 3.0, 2.0]);
        let change = ChangeStats::new(&year1, &year2, &year1).unwrap();

        approx::assert_relative_eq!(change.slope(), 13.0 / 14.0);
        approx::assert_relative_eq!(change.slope_variance(), 27.0 / 392.0);
        approx::assert_relative_eq!(change.proportion_change(), -1.0 / 14.0);

        let p = -1.0 / 14.0;
        let v = 27.0 / 392.0;
        let expected = 3.0 * p * p + v * 36.0 - 3.0 * v;
        approx::assert_relative_eq!(change.area_change_variance(), expected, max_relative = 1e-12);
    }

    #[test]
    fn dominant_year1_variance_keeps_a_positive_standard_error() {
        let year1 = core_with_variance(&[1.0, 2.0], 100.0);
        let year2 = core_with_variance(&[2.0, 1.0], 100.0);
        let change = ChangeStats::new(&year1, &year2, &year1).unwrap();

        approx::assert_relative_eq!(change.slope(), 0.8);
        approx::assert_relative_eq!(change.slope_variance(), 0.36, max_relative = 1e-12);
        // 200 * 0.04 + 0.36 * 9 - 200 * 0.36
        approx::assert_relative_eq!(change.area_change_variance(), 60.76, max_relative = 1e-12);
        approx::assert_relative_eq!(
            change.area_change_standard_error(),
            60.76_f64.sqrt(),
            max_relative = 1e-12
        );
    }

    #[test]
    fn cancelled_slope_variance_uses_its_magnitude() {
        // Year 2 is 0.7 times Year 1, rounded to the nearest double
        let year1 = core(&[49.6, 45.0]);
        let year2 = core(&[34.72, 31.499999999999996]);
        let change = ChangeStats::new(&year1, &year2, &year1).unwrap();

        let residual = change
            .sum_xy()
            .mul_add(-change.sum_xy() / change.sum_x_squared(), change.sum_y_squared());
        assert!(residual < 0.0);

        assert!(change.slope_variance() > 0.0);
        approx::assert_relative_eq!(
            change.slope_variance(),
            residual.abs() / change.sum_x_squared(),
            max_relative = 1e-12
        );
        assert!(change.slope_standard_error().is_finite());
        assert!(change.area_change_standard_error().is_finite());
        approx::assert_relative_eq!(change.slope(), 0.7, max_relative = 1e-12);
    }

    #[test]
    fn unpaired_samples_are_rejected() {
        let year1 = core(&[1.0, 2.0, 3.0]);
        let year2 = core(&[1.0, 2.0]);
        assert!(matches!(
            ChangeStats::new(&year1, &year2, &year1),
            Err(Error::PairingMismatch { .. })
        ));

        let renamed = sample_of(AnalysisStratum::Core, "other", &[(1.0, 1.0), (2.0, 1.0), (3.0, 1.0)]);
        assert!(matches!(
            ChangeStats::new(&year1, &renamed, &year1),
            Err(Error::PairingMismatch { reason, .. }) if reason.contains("core0")
        ));
    }

    #[test]
    fn regression_needs_two_pairs() {
        let single = core(&[5.0]);
        assert!(matches!(
            ChangeStats::new(&single, &single, &single),
            Err(Error::InsufficientPairs { found: 1, .. })
        ));
    }

    #[test]
    fn samples_share_a_stratum() {
        let year1 = core(&[1.0, 2.0]);
        let persistent = sample_of(AnalysisStratum::PersistentFlats, "core", &[(1.0, 1.0), (2.0, 1.0)]);
        assert!(matches!(
            ChangeStats::new(&year1, &persistent, &year1),
            Err(Error::StratumMismatch { .. })
        ));
    }

    #[test]
    fn totals_combine_strata() {
        let core_y1 = core(&[1.0, 2.0, 3.0, 4.0]);
        let core_m1 = core(&[1.0, 2.0, 3.0]);
        let core_m2 = core(&[2.0, 4.0, 6.0]);
        let core_change = ChangeStats::new(&core_m1, &core_m2, &core_y1).unwrap();

        let pf = |values: &[f64]| {
            let values = values.iter().map(|area| (*area, 4.0)).collect::<Vec<_>>();
            sample_of(AnalysisStratum::PersistentFlats, "pfl", &values)
        };
        let pf_y1 = pf(&[10.0, 20.0, 30.0]);
        let pf_m2 = pf(&[5.0, 10.0, 15.0]);
        let pf_change = ChangeStats::new(&pf_y1, &pf_m2, &pf_y1).unwrap();

        let annual = AnnualEstimate::new(vec![&core_y1, &pf_y1]).unwrap();
        let changes = vec![core_change.clone(), pf_change.clone()];
        let total = ChangeStatsTotal::new(&changes, &annual).unwrap();

        // core +10 and persistent flats -30 from a Year 1 total of 70
        approx::assert_relative_eq!(total.area_change(), -20.0);
        approx::assert_relative_eq!(total.proportion_change(), -20.0 / 70.0);
        approx::assert_relative_eq!(
            total.area_change_standard_error(),
            (core_change.area_change_variance() + pf_change.area_change_variance()).sqrt()
        );

        let slope_term = 0.0;
        let area_term = (4.0 * (1.0 * 70.0 + 20.0_f64).powi(2)
            + 12.0 * (-0.5 * 70.0 + 20.0_f64).powi(2))
            / 70.0_f64.powi(4);
        approx::assert_relative_eq!(
            total.proportion_change_standard_error(),
            (slope_term + area_term).sqrt(),
            max_relative = 1e-9
        );
        assert_eq!(total.year1_area(), annual.area());
    }

    #[test]
    fn totals_follow_annual_strata_order() {
        let core_y1 = core(&[1.0, 2.0]);
        let core_change = ChangeStats::new(&core_y1, &core_y1, &core_y1).unwrap();
        let pf_y1 = sample_of(AnalysisStratum::PersistentFlats, "pfl", &[(3.0, 1.0), (4.0, 1.0)]);
        let pf_change = ChangeStats::new(&pf_y1, &pf_y1, &pf_y1).unwrap();

        let annual = AnnualEstimate::new(vec![&core_y1, &pf_y1]).unwrap();
        assert!(matches!(
            ChangeStatsTotal::new(&[pf_change, core_change.clone()], &annual),
            Err(Error::StratumMismatch { .. })
        ));
        assert!(matches!(
            ChangeStatsTotal::new(&[core_change], &annual),
            Err(Error::StratumMismatch { .. })
        ));
    }

    #[test]
    fn empty_year1_reports_no_proportion_change() {
        let empty = core(&[0.0, 0.0]);
        let change = ChangeStats::new(&empty, &empty, &empty).unwrap();
        let annual = AnnualEstimate::new(vec![&empty]).unwrap();
        let total = ChangeStatsTotal::new(&[change], &annual).unwrap();
        assert_eq!(total.proportion_change(), 0.0);
        assert_eq!(total.proportion_change_standard_error(), 0.0);
    }

    proptest! {
        #[test]
        fn scaled_years_recover_the_scale(
            areas in prop::collection::vec(0.1..1e4f64, 2..30),
            scale in 0.01..10.0f64,
        ) {
            let year1 = core(&areas);
            let scaled = areas.iter().map(|area| area * scale).collect::<Vec<_>>();
            let year2 = core(&scaled);
            let change = ChangeStats::new(&year1, &year2, &year1).unwrap();

            approx::assert_relative_eq!(change.slope(), scale, max_relative = 1e-9);
            prop_assert!(change.slope_variance() >= 0.0);
            prop_assert!(change.area_change_variance() >= 0.0);
        }
    }
}
