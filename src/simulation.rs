//! Monte Carlo estimate of the uncertainty in the proportion change of a stratum.
//!
//! Each iteration simulates both sources of error in the change analysis. Sampling error comes
//! from bootstrapping the Year 1 sites and the matched sites, measurement error from shifting
//! every resampled site area by a standard normal multiple of its standard error. The spread of
//! the resulting proportion changes gives an empirical confidence interval.

use std::collections::HashMap;
use std::sync::Arc;

use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::StandardNormal;
use rand_isaac::Isaac64Rng;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::change::ChangeStats;
use crate::config::{check_confidence, SimulationConfig};
use crate::sample::Sample;
use crate::site::Site;
use crate::stratum::{AnalysisStratum, Stratum};
use crate::{Error, Result};

/// Which of the three site lists a simulated site was drawn from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SiteGroup {
    #[serde(rename = "y1")]
    Year1,
    #[serde(rename = "y1match")]
    Year1Matched,
    #[serde(rename = "y2match")]
    Year2Matched,
}

/// A single simulated site, recorded when site tracing is enabled
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SiteTrace {
    pub iteration: usize,
    pub group: SiteGroup,
    pub site: String,
    pub area: f64,
    pub variance: f64,
    pub standard_error: f64,
    pub z: f64,
    pub error: f64,
    pub simulated_area: f64,
}

/// The observed site lists of one stratum, as gathered for a change analysis
#[derive(Clone, Debug)]
pub struct SimulationInput {
    pub stratum: Arc<Stratum>,
    pub year1: Vec<Site>,
    pub year1_matched: Vec<Site>,
    pub year2_matched: Vec<Site>,
}

impl TryFrom<SimulationInput> for MonteCarloSimulator {
    type Error = Error;

    fn try_from(input: SimulationInput) -> Result<Self> {
        Self::new(
            input.stratum,
            input.year1,
            input.year1_matched,
            input.year2_matched,
        )
    }
}

pub struct MonteCarloSimulator {
    stratum: Arc<Stratum>,
    year1: Vec<Site>,
    year1_matched: Vec<Site>,
    year2_by_id: HashMap<String, Site>,
}

impl MonteCarloSimulator {
    /// Prepare a simulation of the change between the matched site lists of one stratum.
    ///
    /// The inputs are checked by running the change analysis on them once, and every matched
    /// Year 1 site must have exactly one Year 2 counterpart, so resampled sites can always be
    /// paired again.
    ///
    /// # Errors
    /// - [`Error::PairingMismatch`] if a Year 1 site has no unique Year 2 counterpart
    /// - any error raised by [`Sample::new`] or [`ChangeStats::new`] on the observed data
    pub fn new(
        stratum: Arc<Stratum>,
        year1: Vec<Site>,
        year1_matched: Vec<Site>,
        year2_matched: Vec<Site>,
    ) -> Result<Self> {
        let analysis = stratum.analysis();
        let mut year2_by_id = HashMap::with_capacity(year2_matched.len());
        for site in &year2_matched {
            if year2_by_id
                .insert(site.id().to_owned(), site.clone())
                .is_some()
            {
                return Err(Error::PairingMismatch {
                    stratum: analysis.label().to_owned(),
                    reason: format!("Year 2 site `{}` appears more than once", site.id()),
                });
            }
        }
        if let Some(site) = year1_matched
            .iter()
            .find(|site| !year2_by_id.contains_key(site.id()))
        {
            return Err(Error::PairingMismatch {
                stratum: analysis.label().to_owned(),
                reason: format!("Year 1 site `{}` has no Year 2 counterpart", site.id()),
            });
        }

        let simulator = Self {
            stratum,
            year1,
            year1_matched,
            year2_by_id,
        };
        let observed = simulator.change(
            simulator.year1.clone(),
            simulator.year1_matched.clone(),
            simulator.rematch(&simulator.year1_matched)?,
        )?;
        debug!(
            stratum = %analysis,
            proportion_change = observed.proportion_change(),
            "observed change before simulation"
        );

        Ok(simulator)
    }

    pub fn analysis(&self) -> AnalysisStratum {
        self.stratum.analysis()
    }

    /// Run the simulation described by `config`.
    ///
    /// Iterations are split into batches of `config.batch_size`, batch `b` drawing from an
    /// [`Isaac64Rng`] seeded with `config.seed + b`. Batches run in parallel and are gathered in
    /// order, so a given seed and batch size always produce the same run.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if `config` does not validate.
    pub fn run(&self, config: &SimulationConfig) -> Result<SimulationRun> {
        config.validate()?;
        let batches = config.iterations.div_ceil(config.batch_size);

        let outcomes = (0..batches)
            .into_par_iter()
            .map(|batch| -> Result<SimulationRun> {
                let start = batch * config.batch_size;
                let end = (start + config.batch_size).min(config.iterations);
                let mut rng = Isaac64Rng::seed_from_u64(config.seed.wrapping_add(batch as u64));
                let mut outcome = SimulationRun::default();
                for iteration in start..end {
                    let trace = config.record_sites.then_some(&mut outcome.sites);
                    let proportion_change = self.iterate(iteration, &mut rng, trace)?;
                    outcome.proportion_changes.push(proportion_change);
                }
                Ok(outcome)
            })
            .collect::<Result<Vec<_>>>()?;

        let run = outcomes
            .into_iter()
            .fold(SimulationRun::default(), |mut run, outcome| {
                run.proportion_changes.extend(outcome.proportion_changes);
                run.sites.extend(outcome.sites);
                run
            });

        info!(
            stratum = %self.analysis(),
            iterations = run.proportion_changes.len(),
            batches,
            mean_proportion_change = run.mean(),
            "finished change simulation"
        );

        Ok(run)
    }

    fn iterate(
        &self,
        iteration: usize,
        rng: &mut impl Rng,
        mut trace: Option<&mut Vec<SiteTrace>>,
    ) -> Result<f64> {
        let year1 = bootstrap(&self.year1, rng);
        let year1_matched = bootstrap(&self.year1_matched, rng);
        let year2_matched = self.rematch(&year1_matched)?;

        let year1 = perturb(&year1, SiteGroup::Year1, iteration, rng, trace.as_deref_mut());
        let year1_matched = perturb(
            &year1_matched,
            SiteGroup::Year1Matched,
            iteration,
            rng,
            trace.as_deref_mut(),
        );
        let year2_matched = perturb(
            &year2_matched,
            SiteGroup::Year2Matched,
            iteration,
            rng,
            trace.as_deref_mut(),
        );

        Ok(self
            .change(year1, year1_matched, year2_matched)?
            .proportion_change())
    }

    fn change(
        &self,
        year1: Vec<Site>,
        year1_matched: Vec<Site>,
        year2_matched: Vec<Site>,
    ) -> Result<ChangeStats> {
        let year1 = Sample::new(year1, Arc::clone(&self.stratum))?;
        let year1_matched = Sample::new(year1_matched, Arc::clone(&self.stratum))?;
        let year2_matched = Sample::new(year2_matched, Arc::clone(&self.stratum))?;
        ChangeStats::new(&year1_matched, &year2_matched, &year1)
    }

    /// The Year 2 counterparts of `year1_matched`, in the same order
    fn rematch(&self, year1_matched: &[Site]) -> Result<Vec<Site>> {
        year1_matched
            .iter()
            .map(|site| {
                self.year2_by_id
                    .get(site.id())
                    .cloned()
                    .ok_or_else(|| Error::PairingMismatch {
                        stratum: self.stratum.analysis().label().to_owned(),
                        reason: format!("Year 1 site `{}` has no Year 2 counterpart", site.id()),
                    })
            })
            .collect()
    }
}

/// Draw `sites.len()` sites with replacement, every draw an independent copy
fn bootstrap(sites: &[Site], rng: &mut impl Rng) -> Vec<Site> {
    (0..sites.len())
        .map(|_| sites[rng.gen_range(0..sites.len())].clone())
        .collect()
}

fn perturb(
    sites: &[Site],
    group: SiteGroup,
    iteration: usize,
    rng: &mut impl Rng,
    mut trace: Option<&mut Vec<SiteTrace>>,
) -> Vec<Site> {
    sites
        .iter()
        .map(|site| {
            let z: f64 = rng.sample(StandardNormal);
            let simulated = site.perturbed(z);
            if let Some(trace) = trace.as_deref_mut() {
                trace.push(SiteTrace {
                    iteration,
                    group,
                    site: site.id().to_owned(),
                    area: site.area(),
                    variance: site.variance(),
                    standard_error: site.standard_error(),
                    z,
                    error: z * site.standard_error(),
                    simulated_area: simulated.area(),
                });
            }
            simulated
        })
        .collect()
}

/// The outcome of a simulation, in iteration order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimulationRun {
    proportion_changes: Vec<f64>,
    sites: Vec<SiteTrace>,
}

impl SimulationRun {
    pub fn proportion_changes(&self) -> &[f64] {
        &self.proportion_changes
    }

    /// Per-site traces, empty unless site recording was requested
    pub fn sites(&self) -> &[SiteTrace] {
        &self.sites
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        if self.proportion_changes.is_empty() {
            return 0.0;
        }
        self.proportion_changes.iter().sum::<f64>() / self.proportion_changes.len() as f64
    }

    /// # Errors
    /// See [`ConfidenceInterval::from_values`].
    pub fn confidence_interval(&self, level: f64) -> Result<ConfidenceInterval> {
        ConfidenceInterval::from_values(&self.proportion_changes, level)
    }
}

/// A symmetric empirical confidence interval about the mean of simulated values
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConfidenceInterval {
    pub mean: f64,
    pub half_width: f64,
    pub level: f64,
}

impl ConfidenceInterval {
    /// The half width is the `level` quantile of the absolute deviations from the mean, taken
    /// as the average of the two sorted deviations either side of index $\lfloor n \cdot
    /// level \rfloor$.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if `values` is empty or `level` is outside (0, 1).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn from_values(values: &[f64], level: f64) -> Result<Self> {
        check_confidence(level)?;
        if values.is_empty() {
            return Err(Error::InvalidParameter {
                name: "values",
                value: "0".into(),
                reason: "a confidence interval needs at least one simulated value".into(),
            });
        }

        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;
        let mut deviations = values
            .iter()
            .map(|value| (value - mean).abs())
            .collect::<Vec<_>>();
        deviations.sort_by(f64::total_cmp);

        let index = ((n as f64 * level).floor() as usize).clamp(1, n.max(2) - 1);
        let half_width = if n == 1 {
            deviations[0]
        } else {
            (deviations[index - 1] + deviations[index]) / 2.0
        };

        Ok(Self {
            mean,
            half_width,
            level,
        })
    }

    pub fn lower(&self) -> f64 {
        self.mean - self.half_width
    }

    pub fn upper(&self) -> f64 {
        self.mean + self.half_width
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ConfidenceInterval, MonteCarloSimulator, SiteGroup};
    use crate::config::SimulationConfig;
    use crate::site::Site;
    use crate::stratum::{AnalysisStratum, Stratum};
    use crate::Error;

    fn sites(values: &[(&str, f64, f64)]) -> Vec<Site> {
        values
            .iter()
            .map(|(id, area, variance)| Site::new(*id, *area, *variance, None, None).unwrap())
            .collect()
    }

    fn core() -> Arc<Stratum> {
        Arc::new(Stratum::unextrapolated(AnalysisStratum::Core).unwrap())
    }

    fn config(iterations: usize, batch_size: usize) -> SimulationConfig {
        SimulationConfig {
            iterations,
            batch_size,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn interval_of_a_known_sequence() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let half = ConfidenceInterval::from_values(&values, 0.5).unwrap();
        approx::assert_relative_eq!(half.mean, 3.0);
        approx::assert_relative_eq!(half.half_width, 1.0);

        let wide = ConfidenceInterval::from_values(&values, 0.95).unwrap();
        approx::assert_relative_eq!(wide.half_width, 2.0);
        approx::assert_relative_eq!(wide.lower(), 1.0);
        approx::assert_relative_eq!(wide.upper(), 5.0);
    }

    #[test]
    fn interval_needs_values_and_a_valid_level() {
        assert!(matches!(
            ConfidenceInterval::from_values(&[], 0.95),
            Err(Error::InvalidParameter { name: "values", .. })
        ));
        assert!(ConfidenceInterval::from_values(&[1.0], 1.5).is_err());
        let single = ConfidenceInterval::from_values(&[0.25], 0.95).unwrap();
        approx::assert_abs_diff_eq!(single.half_width, 0.0);
    }

    #[test]
    fn simulation_is_deterministic_for_a_seed() {
        let year1 = sites(&[("a", 10.0, 4.0), ("b", 20.0, 9.0), ("c", 30.0, 1.0), ("d", 5.0, 1.0)]);
        let year1_matched = sites(&[("a", 10.0, 4.0), ("b", 20.0, 9.0), ("c", 30.0, 1.0)]);
        let year2_matched = sites(&[("c", 33.0, 2.0), ("a", 12.0, 1.0), ("b", 18.0, 4.0)]);
        let simulator =
            MonteCarloSimulator::new(core(), year1, year1_matched, year2_matched).unwrap();

        let first = simulator.run(&config(250, 16)).unwrap();
        let second = simulator.run(&config(250, 16)).unwrap();
        assert_eq!(first.proportion_changes().len(), 250);
        assert_eq!(first.proportion_changes(), second.proportion_changes());

        let reseeded = simulator
            .run(&SimulationConfig {
                seed: 41,
                ..config(250, 16)
            })
            .unwrap();
        assert_ne!(first.proportion_changes(), reseeded.proportion_changes());
    }

    #[test]
    fn error_free_identical_years_show_no_change() {
        let observed = [("a", 10.0, 0.0), ("b", 20.0, 0.0), ("c", 30.0, 0.0)];
        let simulator = MonteCarloSimulator::new(
            core(),
            sites(&observed),
            sites(&observed),
            sites(&observed),
        )
        .unwrap();
        let run = simulator.run(&config(100, 7)).unwrap();
        let interval = run.confidence_interval(0.95).unwrap();

        approx::assert_abs_diff_eq!(interval.mean, 0.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(interval.half_width, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn site_traces_cover_every_group() {
        let observed = [("a", 10.0, 4.0), ("b", 20.0, 9.0)];
        let simulator = MonteCarloSimulator::new(
            core(),
            sites(&[("a", 10.0, 4.0), ("b", 20.0, 9.0), ("c", 1.0, 1.0)]),
            sites(&observed),
            sites(&observed),
        )
        .unwrap();
        let run = simulator
            .run(&SimulationConfig {
                record_sites: true,
                ..config(5, 2)
            })
            .unwrap();

        // 3 + 2 + 2 sites per iteration
        assert_eq!(run.sites().len(), 35);
        let iterations = run.sites().iter().map(|trace| trace.iteration).collect::<Vec<_>>();
        assert!(iterations.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(
            run.sites()
                .iter()
                .filter(|trace| trace.group == SiteGroup::Year2Matched)
                .count(),
            10
        );
        for trace in run.sites() {
            approx::assert_relative_eq!(
                trace.simulated_area,
                (trace.area + trace.error).max(0.0),
                epsilon = 1e-12,
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn matched_sites_need_a_counterpart() {
        let year1 = sites(&[("a", 1.0, 0.0), ("b", 2.0, 0.0)]);
        let year2 = sites(&[("a", 1.0, 0.0), ("z", 2.0, 0.0)]);
        assert!(matches!(
            MonteCarloSimulator::new(core(), year1.clone(), year1.clone(), year2),
            Err(Error::PairingMismatch { reason, .. }) if reason.contains("`b`")
        ));

        let doubled = sites(&[("a", 1.0, 0.0), ("a", 2.0, 0.0)]);
        assert!(matches!(
            MonteCarloSimulator::new(core(), year1.clone(), year1, doubled),
            Err(Error::PairingMismatch { .. })
        ));
    }
}
