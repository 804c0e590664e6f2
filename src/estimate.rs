use ndarray::Array1;
use tracing::info;

use crate::sample::Sample;
use crate::stratum::AnalysisStratum;
use crate::{Error, Result};

/// A design-based area estimate with its sampling variance
pub trait AreaEstimate {
    /// Estimated eelgrass area in square metres
    fn area(&self) -> f64;

    /// Variance of the area estimate
    fn variance(&self) -> f64;

    fn standard_error(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Standard error relative to the estimate, zero when the estimated area is zero
    #[allow(clippy::float_cmp)]
    fn coefficient_of_variation(&self) -> f64 {
        let area = self.area();
        if area == 0.0 {
            0.0
        } else {
            self.standard_error() / area
        }
    }
}

/// The soundwide estimate for one survey year, aggregated over disjoint strata.
///
/// Strata are sampled independently so the total variance is the sum of the stratum variances.
#[derive(Clone, Debug)]
pub struct AnnualEstimate<'a> {
    samples: Vec<&'a Sample>,
    area: f64,
    variance: f64,
}

impl<'a> AnnualEstimate<'a> {
    /// # Errors
    /// - [`Error::NoSamples`] if `samples` is empty
    /// - [`Error::DuplicateStratum`] if two samples share an analysis stratum
    pub fn new(samples: Vec<&'a Sample>) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::NoSamples);
        }
        for (ii, sample) in samples.iter().enumerate() {
            if samples[..ii]
                .iter()
                .any(|other| other.analysis() == sample.analysis())
            {
                return Err(Error::DuplicateStratum {
                    stratum: sample.analysis().label().to_owned(),
                });
            }
        }

        let area = samples.iter().map(|sample| sample.area()).sum();
        let variance = samples.iter().map(|sample| sample.variance()).sum();

        info!(
            strata = samples.len(),
            area,
            variance,
            "estimated annual area"
        );

        Ok(Self {
            samples,
            area,
            variance,
        })
    }

    pub fn samples(&self) -> &[&'a Sample] {
        &self.samples
    }

    /// Analysis strata in the order the samples were supplied
    pub fn strata(&self) -> impl Iterator<Item = AnalysisStratum> + '_ {
        self.samples.iter().map(|sample| sample.analysis())
    }

    pub fn sample(&self, analysis: AnalysisStratum) -> Option<&'a Sample> {
        self.samples
            .iter()
            .find(|sample| sample.analysis() == analysis)
            .copied()
    }

    /// Stratum areas in sample order
    pub fn areas(&self) -> Array1<f64> {
        self.samples.iter().map(|sample| sample.area()).collect()
    }

    /// Stratum variances in sample order
    pub fn variances(&self) -> Array1<f64> {
        self.samples.iter().map(|sample| sample.variance()).collect()
    }
}

impl AreaEstimate for AnnualEstimate<'_> {
    fn area(&self) -> f64 {
        self.area
    }

    fn variance(&self) -> f64 {
        self.variance
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ndarray_rand::rand::{Rng, SeedableRng};
    use rand_isaac::Isaac64Rng;

    use super::{AnnualEstimate, AreaEstimate};
    use crate::sample::Sample;
    use crate::site::Site;
    use crate::stratum::{AnalysisStratum, Stratum};
    use crate::Error;

    fn sample(analysis: AnalysisStratum, values: &[(f64, f64)]) -> Sample {
        let sites = values
            .iter()
            .enumerate()
            .map(|(ii, (area, variance))| {
                Site::new(format!("{analysis}{ii}"), *area, *variance, None, None).unwrap()
            })
            .collect();
        Sample::new(
            sites,
            Arc::new(Stratum::unextrapolated(analysis).unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn annual_totals_are_exact_sums_of_strata() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let mut random = |n: usize| {
            (0..n)
                .map(|_| (rng.gen_range(0.0..1e5), rng.gen_range(0.0..1e3)))
                .collect::<Vec<(f64, f64)>>()
        };
        let core = sample(AnalysisStratum::Core, &random(7));
        let persistent = sample(AnalysisStratum::PersistentFlats, &random(3));

        let annual = AnnualEstimate::new(vec![&core, &persistent]).unwrap();

        assert_eq!(annual.area(), core.area() + persistent.area());
        assert_eq!(annual.variance(), core.variance() + persistent.variance());
        assert_eq!(annual.areas().to_vec(), vec![core.area(), persistent.area()]);
        assert_eq!(
            annual.strata().collect::<Vec<_>>(),
            vec![AnalysisStratum::Core, AnalysisStratum::PersistentFlats]
        );
        approx::assert_relative_eq!(annual.standard_error(), annual.variance().sqrt());
    }

    #[test]
    fn annual_estimate_needs_samples() {
        assert!(matches!(AnnualEstimate::new(vec![]), Err(Error::NoSamples)));
    }

    #[test]
    fn strata_appear_once() {
        let first = sample(AnalysisStratum::Core, &[(1.0, 1.0)]);
        let second = sample(AnalysisStratum::Core, &[(2.0, 1.0)]);
        assert!(matches!(
            AnnualEstimate::new(vec![&first, &second]),
            Err(Error::DuplicateStratum { stratum }) if stratum == "core"
        ));
    }

    #[test]
    fn samples_are_found_by_stratum() {
        let core = sample(AnalysisStratum::Core, &[(1.0, 1.0)]);
        let annual = AnnualEstimate::new(vec![&core]).unwrap();
        assert!(annual.sample(AnalysisStratum::Core).is_some());
        assert!(annual.sample(AnalysisStratum::Flats).is_none());
    }

    #[test]
    fn zero_area_estimate_has_zero_cv() {
        let empty = sample(AnalysisStratum::Core, &[(0.0, 0.0)]);
        let annual = AnnualEstimate::new(vec![&empty]).unwrap();
        approx::assert_abs_diff_eq!(annual.coefficient_of_variation(), 0.0);
    }
}
