//! Flat records for every result, written as CSV with one header row.
//!
//! Columns follow the field order of each record. Values that do not apply to a stratum, such as
//! the population length of a flats stratum, are left empty.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::change::{ChangeStats, ChangeStatsTotal};
use crate::estimate::{AnnualEstimate, AreaEstimate};
use crate::sample::Sample;
use crate::simulation::SimulationRun;
use crate::stratum::{AnalysisStratum, Extrapolation, PopulationConstants};
use crate::Result;

/// Area estimate of one stratum
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StratumRecord {
    pub survey_year: i32,
    pub stratum: AnalysisStratum,
    pub extrapolation: Extrapolation,
    pub sample_group: String,
    pub area: f64,
    pub variance: f64,
    pub standard_error: f64,
    pub cv: f64,
    pub sample_size: usize,
    pub population_count: Option<usize>,
    pub population_area: Option<f64>,
    pub sample_area_sum: Option<f64>,
    pub ratio: Option<f64>,
    pub population_length: Option<f64>,
    pub normalizing_length: Option<f64>,
}

impl StratumRecord {
    pub fn new(survey_year: i32, sample_group: &str, sample: &Sample) -> Self {
        let stratum = sample.stratum();
        let (population_area, population_length, normalizing_length) = match *stratum.constants()
        {
            PopulationConstants::None => (None, None, None),
            PopulationConstants::Area {
                population_area, ..
            } => (Some(population_area), None, None),
            PopulationConstants::Linear {
                population_length,
                normalizing_length,
                ..
            } => (None, Some(population_length), Some(normalizing_length)),
        };

        Self {
            survey_year,
            stratum: stratum.analysis(),
            extrapolation: stratum.extrapolation(),
            sample_group: sample_group.to_owned(),
            area: sample.area(),
            variance: sample.variance(),
            standard_error: sample.standard_error(),
            cv: sample.coefficient_of_variation(),
            sample_size: sample.len(),
            population_count: stratum.population_count(),
            population_area,
            sample_area_sum: sample.total_sample_area(),
            ratio: sample.ratio(),
            population_length,
            normalizing_length,
        }
    }
}

/// Area estimate summed over all strata
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnnualRecord {
    pub survey_year: i32,
    pub sample_group: String,
    pub area: f64,
    pub variance: f64,
    pub standard_error: f64,
    pub cv: f64,
}

impl AnnualRecord {
    pub fn new(survey_year: i32, sample_group: &str, annual: &AnnualEstimate<'_>) -> Self {
        Self {
            survey_year,
            sample_group: sample_group.to_owned(),
            area: annual.area(),
            variance: annual.variance(),
            standard_error: annual.standard_error(),
            cv: annual.coefficient_of_variation(),
        }
    }
}

/// Change analysis of one stratum
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub year1: i32,
    pub year2: i32,
    pub stratum: AnalysisStratum,
    pub extrapolation: Extrapolation,
    pub sample_group: String,
    pub year1_area: f64,
    pub year1_variance: f64,
    pub year1_sites: usize,
    pub matched_sites: usize,
    pub slope: f64,
    pub slope_se: f64,
    pub proportion_change: f64,
    pub percent_change: f64,
    pub area_change: f64,
    pub area_change_se: f64,
}

impl ChangeRecord {
    pub fn new(year1: i32, year2: i32, sample_group: &str, change: &ChangeStats) -> Self {
        let stratum = change.analysis();
        Self {
            year1,
            year2,
            stratum,
            extrapolation: stratum.extrapolation(),
            sample_group: sample_group.to_owned(),
            year1_area: change.year1_area(),
            year1_variance: change.year1_variance(),
            year1_sites: change.year1_sites(),
            matched_sites: change.matched_sites(),
            slope: change.slope(),
            slope_se: change.slope_standard_error(),
            proportion_change: change.proportion_change(),
            percent_change: change.percent_change(),
            area_change: change.area_change(),
            area_change_se: change.area_change_standard_error(),
        }
    }
}

/// Change summed over all strata
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChangeTotalRecord {
    pub year1: i32,
    pub year2: i32,
    pub sample_group: String,
    pub proportion_change: f64,
    pub proportion_change_se: f64,
    pub percent_change: f64,
    pub area_change: f64,
    pub area_change_se: f64,
}

impl ChangeTotalRecord {
    pub fn new(year1: i32, year2: i32, sample_group: &str, total: &ChangeStatsTotal) -> Self {
        Self {
            year1,
            year2,
            sample_group: sample_group.to_owned(),
            proportion_change: total.proportion_change(),
            proportion_change_se: total.proportion_change_standard_error(),
            percent_change: total.percent_change(),
            area_change: total.area_change(),
            area_change_se: total.area_change_standard_error(),
        }
    }
}

/// Proportion change of one simulation iteration
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub proportion_change: f64,
}

pub fn iteration_records(run: &SimulationRun) -> Vec<IterationRecord> {
    run.proportion_changes()
        .iter()
        .enumerate()
        .map(|(iteration, proportion_change)| IterationRecord {
            iteration,
            proportion_change: *proportion_change,
        })
        .collect()
}

/// Write `records` as CSV, preceded by a header row taken from the record fields
///
/// # Errors
/// Returns an error if a record cannot be serialised or the writer fails.
pub fn write_records<W, R>(writer: W, records: impl IntoIterator<Item = R>) -> Result<()>
where
    W: Write,
    R: Serialize,
{
    let mut wtr = csv::Writer::from_writer(writer);
    for record in records {
        wtr.serialize(record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn write_records_to_path<R: Serialize>(
    path: impl AsRef<Path>,
    records: impl IntoIterator<Item = R>,
) -> Result<()> {
    write_records(File::create(path)?, records)
}
