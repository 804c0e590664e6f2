//! Gather site data for a survey year from a [`DataSource`] and run the estimators on it.
//!
//! The all-sites feature class defines the sampling frame: which sites were visited in a year,
//! and the geomorphic and sampling strata each belongs to. Site measurements come from the site
//! statistics table, and the population constants of extrapolated strata from the flats and
//! fringe feature classes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use itertools::Itertools;
use tracing::{info, warn};

use crate::change::{ChangeStats, ChangeStatsTotal};
use crate::config::{Config, LayerConfig};
use crate::estimate::{AnnualEstimate, AreaEstimate};
use crate::report::{AnnualRecord, ChangeRecord, ChangeTotalRecord, StratumRecord};
use crate::sample::Sample;
use crate::simulation::SimulationInput;
use crate::site::{Site, SiteRow};
use crate::source::{DataSource, Filter, Value};
use crate::stratum::{AnalysisStratum, Extrapolation, Stratum, StratumScheme};
use crate::units::Conversion;
use crate::{Error, Result};

/// Site point identifier in the all-sites and flats feature classes
pub const SITE_POINT_FIELD: &str = "NAME";
pub const GEO_STRATUM_FIELD: &str = "STRATA_GEO";
pub const SAMPLING_STRATUM_FIELD: &str = "STRATUM";

/// Site identifier in the site statistics table
pub const SITE_ID_FIELD: &str = "site_code";
pub const AREA_FIELD: &str = "est_basalcov";
pub const AREA_VARIANCE_FIELD: &str = "estvar_basalcov";
pub const SAMPLE_DATE_FIELD: &str = "date_samp_start";

pub const FLATS_FOCUS_FIELD: &str = "focus_stra";
pub const FRINGE_TYPE_FIELD: &str = "2002TYPE";
pub const REGION_FIELD: &str = "REGION";

pub const SOUNDWIDE: &str = "soundwide";

/// Sampling types of the soundwide frame in the `Y{year}SAMP` field
const SOUNDWIDE_SAMPLING: [&str; 3] = ["sw", "sw_focus", "sw_other"];

/// Sites visited in `year` as part of the sample group's area estimate
///
/// # Errors
/// Returns [`Error::InvalidParameter`] for sample groups other than soundwide.
pub fn area_frame(sample_group: &str, year: i32) -> Result<Filter> {
    check_sample_group(sample_group)?;
    Ok(Filter::is_in(format!("Y{year}SAMP"), SOUNDWIDE_SAMPLING))
}

/// Sites visited in `year1`, and in `year2` too when given
///
/// # Errors
/// Returns [`Error::InvalidParameter`] for sample groups other than soundwide.
pub fn change_frame(sample_group: &str, year1: i32, year2: Option<i32>) -> Result<Filter> {
    check_sample_group(sample_group)?;
    let frame = Filter::equals(format!("Y{year1}"), 1_i64);
    Ok(match year2 {
        Some(year2) => frame.and(Filter::equals(format!("Y{year2}"), 1_i64)),
        None => frame,
    })
}

fn check_sample_group(sample_group: &str) -> Result<()> {
    if sample_group == SOUNDWIDE {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name: "sample_group",
            value: sample_group.to_owned(),
            reason: format!("only the {SOUNDWIDE} sample group is implemented"),
        })
    }
}

/// Rotational flats in the flats feature class, excluding core and persistent flats
pub fn flats_population() -> Filter {
    Filter::not_equals(SITE_POINT_FIELD, "").and(Filter::not_in(FLATS_FOCUS_FIELD, ["c", "pfl"]))
}

/// Fringe sampling units counted in $N_i$
///
/// # Errors
/// Returns [`Error::InvalidStratumKind`] unless `analysis` is a fringe stratum.
pub fn fringe_population(analysis: AnalysisStratum) -> Result<Filter> {
    let fringe_type = fringe_type(analysis)?;
    Ok(Filter::equals(FRINGE_TYPE_FIELD, fringe_type).and(outside_south_sound()))
}

/// Fringe shoreline summed into $L_T$, including the short orphan segments
///
/// # Errors
/// Returns [`Error::InvalidStratumKind`] unless `analysis` is a fringe stratum.
pub fn fringe_extent(analysis: AnalysisStratum) -> Result<Filter> {
    let fringe_type = fringe_type(analysis)?;
    Ok(Filter::is_in(
        FRINGE_TYPE_FIELD,
        [fringe_type.to_owned(), format!("{fringe_type}-orphan<984m")],
    )
    .and(outside_south_sound()))
}

fn outside_south_sound() -> Filter {
    Filter::not_equals(REGION_FIELD, "sps")
}

fn fringe_type(analysis: AnalysisStratum) -> Result<&'static str> {
    match analysis {
        AnalysisStratum::Fringe => Ok("fr"),
        AnalysisStratum::WideFringe => Ok("frw"),
        other => Err(Error::InvalidStratumKind {
            stratum: other.label().to_owned(),
            expected: "fringe",
        }),
    }
}

/// Site identifiers in a frame, grouped by analysis stratum and sorted within each group
fn frame_strata(
    source: &impl DataSource,
    layers: &LayerConfig,
    frame: &Filter,
    scheme: StratumScheme,
) -> Result<HashMap<AnalysisStratum, Vec<String>>> {
    let results = source.query_table(
        &layers.all_sites,
        frame,
        &[GEO_STRATUM_FIELD, SAMPLING_STRATUM_FIELD],
        SITE_POINT_FIELD,
    )?;

    results
        .into_iter()
        .map(|(site, values)| -> Result<(AnalysisStratum, String)> {
            let geo = text_field(&layers.all_sites, &site, GEO_STRATUM_FIELD, values.first())?;
            let sampling =
                text_field(&layers.all_sites, &site, SAMPLING_STRATUM_FIELD, values.get(1))?;
            Ok((scheme.classify(geo, sampling)?, site))
        })
        .collect::<Result<Vec<_>>>()
        .map(|classified| classified.into_iter().into_group_map())
}

fn text_field<'a>(
    table: &str,
    site: &str,
    field: &str,
    value: Option<&'a Value>,
) -> Result<&'a str> {
    value.and_then(Value::as_text).ok_or_else(|| {
        Error::Query(format!(
            "site `{site}` in `{table}` has no text value for `{field}`"
        ))
    })
}

fn number_field(table: &str, site: &str, field: &str, value: Option<&Value>) -> Result<f64> {
    value.and_then(Value::as_f64).ok_or_else(|| {
        Error::Query(format!(
            "site `{site}` in `{table}` has no numeric value for `{field}`"
        ))
    })
}

/// Area and variance of every site in `sites` sampled during `year`
///
/// # Errors
/// Returns [`Error::MissingSiteInDataSource`] if any of `sites` has no record for the year.
fn site_rows(
    source: &impl DataSource,
    layers: &LayerConfig,
    sites: &[String],
    year: i32,
) -> Result<BTreeMap<String, SiteRow>> {
    let table = &layers.site_table;
    let filter = Filter::is_in(SITE_ID_FIELD, sites.iter().cloned())
        .and(Filter::in_year(SAMPLE_DATE_FIELD, year));
    let results = source.query_table(
        table,
        &filter,
        &[AREA_FIELD, AREA_VARIANCE_FIELD],
        SITE_ID_FIELD,
    )?;

    let missing = sites
        .iter()
        .filter(|site| !results.contains_key(*site))
        .cloned()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(Error::MissingSiteInDataSource {
            table: table.clone(),
            year,
            sites: missing,
        });
    }

    results
        .into_iter()
        .map(|(site, values)| -> Result<(String, SiteRow)> {
            let area = number_field(table, &site, AREA_FIELD, values.first())?;
            let variance = number_field(table, &site, AREA_VARIANCE_FIELD, values.get(1))?;
            Ok((site.clone(), SiteRow::new(site, area, variance)))
        })
        .collect()
}

/// Sample area of each rotational flats site, from the flats polygons
fn sample_areas(
    source: &impl DataSource,
    layers: &LayerConfig,
    sites: &[String],
) -> Result<BTreeMap<String, f64>> {
    let results = source.query_table(
        &layers.flats,
        &Filter::is_in(SITE_POINT_FIELD, sites.iter().cloned()),
        &[layers.sample_area_field.as_str()],
        SITE_POINT_FIELD,
    )?;
    results
        .into_iter()
        .map(|(site, values)| -> Result<(String, f64)> {
            let area =
                number_field(&layers.flats, &site, &layers.sample_area_field, values.first())?;
            Ok((site, area))
        })
        .collect()
}

/// The stratum with its population constants taken from the frame feature classes
///
/// # Errors
/// Propagates data source failures.
pub fn load_stratum(
    source: &impl DataSource,
    layers: &LayerConfig,
    analysis: AnalysisStratum,
    conversion: Option<Conversion>,
) -> Result<Stratum> {
    let stratum = match analysis.extrapolation() {
        Extrapolation::None => Stratum::unextrapolated(analysis)?,
        Extrapolation::Area => {
            let flats = source.query_features(&layers.flats, &flats_population())?;
            Stratum::from_features(analysis, &flats, &flats, conversion)?
        }
        Extrapolation::Linear => {
            let population = source.query_features(&layers.fringe, &fringe_population(analysis)?)?;
            let extent = source.query_features(&layers.fringe, &fringe_extent(analysis)?)?;
            Stratum::from_features(analysis, &population, &extent, conversion)?
        }
    };
    info!(stratum = %analysis, constants = ?stratum.constants(), "loaded stratum constants");
    Ok(stratum)
}

/// Sites of one stratum, in the order of `ids`
fn stratum_sites(
    ids: &[String],
    rows: &BTreeMap<String, SiteRow>,
    sample_areas: &BTreeMap<String, f64>,
    analysis: AnalysisStratum,
    conversion: Option<Conversion>,
) -> Result<Vec<Site>> {
    ids.iter()
        .map(|id| -> Result<Site> {
            let row = rows.get(id).cloned().ok_or_else(|| {
                Error::Query(format!("site `{id}` was not returned by the site statistics query"))
            })?;
            let row = match (analysis.extrapolation(), sample_areas.get(id)) {
                (Extrapolation::Area, Some(area)) => row.with_sample_area(*area),
                _ => row,
            };
            Site::from_row(row, conversion)
        })
        .collect()
}

/// Measurements of the sites of a frame for one year
struct YearData {
    rows: BTreeMap<String, SiteRow>,
    sample_areas: BTreeMap<String, f64>,
}

impl YearData {
    fn load(
        source: &impl DataSource,
        layers: &LayerConfig,
        groups: &HashMap<AnalysisStratum, Vec<String>>,
        year: i32,
    ) -> Result<Self> {
        let sites = groups.values().flatten().cloned().sorted().collect::<Vec<_>>();
        let flats = groups
            .get(&AnalysisStratum::Flats)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            rows: site_rows(source, layers, &sites, year).map_err(|e| e.in_year(year))?,
            sample_areas: if flats.is_empty() {
                BTreeMap::new()
            } else {
                sample_areas(source, layers, &flats)?
            },
        })
    }

    fn sites(
        &self,
        ids: &[String],
        analysis: AnalysisStratum,
        conversion: Option<Conversion>,
    ) -> Result<Vec<Site>> {
        stratum_sites(ids, &self.rows, &self.sample_areas, analysis, conversion)
    }
}

/// Area estimates for every stratum sampled in a survey year
#[derive(Clone, Debug)]
pub struct AreaSurvey {
    year: i32,
    sample_group: String,
    samples: Vec<Sample>,
}

impl AreaSurvey {
    pub const fn year(&self) -> i32 {
        self.year
    }

    pub fn sample_group(&self) -> &str {
        &self.sample_group
    }

    /// Stratum samples in report order
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn sample(&self, analysis: AnalysisStratum) -> Option<&Sample> {
        self.samples.iter().find(|sample| sample.analysis() == analysis)
    }

    /// # Errors
    /// See [`AnnualEstimate::new`].
    pub fn annual(&self) -> Result<AnnualEstimate<'_>> {
        AnnualEstimate::new(self.samples.iter().collect())
    }

    pub fn stratum_records(&self) -> Vec<StratumRecord> {
        self.samples
            .iter()
            .map(|sample| StratumRecord::new(self.year, &self.sample_group, sample))
            .collect()
    }

    /// # Errors
    /// See [`AnnualEstimate::new`].
    pub fn annual_record(&self) -> Result<AnnualRecord> {
        Ok(AnnualRecord::new(
            self.year,
            &self.sample_group,
            &self.annual()?,
        ))
    }
}

/// Estimate the area of every stratum for the configured survey year.
///
/// Strata without sampled sites that year are left out.
///
/// # Errors
/// Any failure is reported as an [`Error::Survey`] for the year.
pub fn estimate_year(source: &impl DataSource, config: &Config) -> Result<AreaSurvey> {
    let year = config.survey.year;
    estimate_year_inner(source, config).map_err(|e| e.in_year(year))
}

fn estimate_year_inner(source: &impl DataSource, config: &Config) -> Result<AreaSurvey> {
    let survey = &config.survey;
    let layers = &config.layers;
    let scheme = StratumScheme::AreaEstimate;

    let frame = area_frame(&survey.sample_group, survey.year)?;
    let groups = frame_strata(source, layers, &frame, scheme)?;
    let data = YearData::load(source, layers, &groups, survey.year)?;

    let mut samples = vec![];
    for &analysis in scheme.strata() {
        let Some(ids) = groups.get(&analysis) else {
            warn!(stratum = %analysis, year = survey.year, "no sites sampled in stratum");
            continue;
        };
        let stratum = Arc::new(load_stratum(source, layers, analysis, survey.conversion)?);
        let sample = Sample::new(data.sites(ids, analysis, survey.conversion)?, stratum)?;
        info!(
            stratum = %analysis,
            year = survey.year,
            sites = sample.len(),
            area = sample.area(),
            standard_error = sample.standard_error(),
            cv = sample.coefficient_of_variation(),
            "estimated stratum area"
        );
        samples.push(sample);
    }

    Ok(AreaSurvey {
        year: survey.year,
        sample_group: survey.sample_group.clone(),
        samples,
    })
}

/// The three samples and the change analysis of one stratum
#[derive(Clone, Debug)]
pub struct StratumChange {
    pub year1: Sample,
    pub year1_matched: Sample,
    pub year2_matched: Sample,
    pub change: ChangeStats,
}

impl StratumChange {
    pub fn analysis(&self) -> AnalysisStratum {
        self.change.analysis()
    }
}

/// Change between two survey years for every stratum and in total
#[derive(Clone, Debug)]
pub struct ChangeSurvey {
    year1: i32,
    year2: i32,
    sample_group: String,
    strata: Vec<StratumChange>,
    total: ChangeStatsTotal,
}

impl ChangeSurvey {
    pub const fn year1(&self) -> i32 {
        self.year1
    }

    pub const fn year2(&self) -> i32 {
        self.year2
    }

    pub fn sample_group(&self) -> &str {
        &self.sample_group
    }

    pub fn strata(&self) -> &[StratumChange] {
        &self.strata
    }

    pub fn stratum(&self, analysis: AnalysisStratum) -> Option<&StratumChange> {
        self.strata.iter().find(|stratum| stratum.analysis() == analysis)
    }

    pub const fn total(&self) -> &ChangeStatsTotal {
        &self.total
    }

    /// # Errors
    /// See [`AnnualEstimate::new`].
    pub fn year1_annual(&self) -> Result<AnnualEstimate<'_>> {
        AnnualEstimate::new(self.strata.iter().map(|stratum| &stratum.year1).collect())
    }

    /// The observed site lists of a stratum, ready for a Monte Carlo simulation
    pub fn simulation_input(&self, analysis: AnalysisStratum) -> Option<SimulationInput> {
        self.stratum(analysis).map(|stratum| SimulationInput {
            stratum: Arc::clone(stratum.year1.stratum_handle()),
            year1: stratum.year1.sites().to_vec(),
            year1_matched: stratum.year1_matched.sites().to_vec(),
            year2_matched: stratum.year2_matched.sites().to_vec(),
        })
    }

    pub fn change_records(&self) -> Vec<ChangeRecord> {
        self.strata
            .iter()
            .map(|stratum| {
                ChangeRecord::new(self.year1, self.year2, &self.sample_group, &stratum.change)
            })
            .collect()
    }

    pub fn total_record(&self) -> ChangeTotalRecord {
        ChangeTotalRecord::new(self.year1, self.year2, &self.sample_group, &self.total)
    }
}

/// Compare the configured survey year with its comparison year.
///
/// Persistent flats are analysed with the core stratum. Strata without sites sampled in
/// Year 1 are left out of both the stratum results and the total.
///
/// # Errors
/// Returns [`Error::InvalidParameter`] if no comparison year is configured. Other failures are
/// reported as an [`Error::Survey`] for the year they concern.
pub fn analyze_change(source: &impl DataSource, config: &Config) -> Result<ChangeSurvey> {
    let year1 = config.survey.year;
    let year2 = config.survey.comparison_year.ok_or_else(|| Error::InvalidParameter {
        name: "comparison_year",
        value: "none".into(),
        reason: "a change analysis needs a second survey year".into(),
    })?;
    analyze_change_inner(source, config, year1, year2).map_err(|e| e.in_year(year1))
}

fn analyze_change_inner(
    source: &impl DataSource,
    config: &Config,
    year1: i32,
    year2: i32,
) -> Result<ChangeSurvey> {
    let survey = &config.survey;
    let layers = &config.layers;
    let conversion = survey.conversion;
    let scheme = StratumScheme::ChangeAnalysis;

    let matched_frame = change_frame(&survey.sample_group, year1, Some(year2))?;
    let matched_groups = frame_strata(source, layers, &matched_frame, scheme)?;
    let year1_matched_data = YearData::load(source, layers, &matched_groups, year1)?;
    let year2_matched_data = YearData::load(source, layers, &matched_groups, year2)?;

    let year1_frame = change_frame(&survey.sample_group, year1, None)?;
    let year1_groups = frame_strata(source, layers, &year1_frame, scheme)?;
    let year1_data = YearData::load(source, layers, &year1_groups, year1)?;

    let mut strata = vec![];
    for &analysis in scheme.strata() {
        let Some(year1_ids) = year1_groups.get(&analysis) else {
            warn!(stratum = %analysis, year = year1, "no sites sampled in stratum");
            continue;
        };
        let matched_ids = matched_groups.get(&analysis).cloned().unwrap_or_default();
        let stratum = Arc::new(load_stratum(source, layers, analysis, conversion)?);

        let year1_all = Sample::new(
            year1_data.sites(year1_ids, analysis, conversion)?,
            Arc::clone(&stratum),
        )?;
        let year1_matched = Sample::new(
            year1_matched_data.sites(&matched_ids, analysis, conversion)?,
            Arc::clone(&stratum),
        )?;
        let year2_matched = Sample::new(
            year2_matched_data.sites(&matched_ids, analysis, conversion)?,
            Arc::clone(&stratum),
        )?;
        let change = ChangeStats::new(&year1_matched, &year2_matched, &year1_all)?;

        info!(
            stratum = %analysis,
            year1_sites = change.year1_sites(),
            matched_sites = change.matched_sites(),
            proportion_change = change.proportion_change(),
            area_change = change.area_change(),
            area_change_se = change.area_change_standard_error(),
            "estimated stratum change"
        );

        strata.push(StratumChange {
            year1: year1_all,
            year1_matched,
            year2_matched,
            change,
        });
    }

    let total = {
        let annual = AnnualEstimate::new(strata.iter().map(|stratum| &stratum.year1).collect())?;
        let changes = strata
            .iter()
            .map(|stratum| stratum.change.clone())
            .collect::<Vec<_>>();
        ChangeStatsTotal::new(&changes, &annual)?
    };

    Ok(ChangeSurvey {
        year1,
        year2,
        sample_group: survey.sample_group.clone(),
        strata,
        total,
    })
}
