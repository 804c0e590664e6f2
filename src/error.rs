//! Error types for area estimation and change analysis

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unit conversion `{0}` is not available")]
    InvalidConversion(String),

    #[error("analysis stratum `{stratum}` is not valid for a {expected} stratum")]
    InvalidStratumKind {
        stratum: String,
        expected: &'static str,
    },

    #[error("sample for stratum `{stratum}` contains no sites")]
    EmptySample { stratum: String },

    #[error("site `{site}` in stratum `{stratum}` has no sample area")]
    MissingSampleArea { stratum: String, site: String },

    #[error("sum of sample areas in stratum `{stratum}` is zero")]
    ZeroSampleArea { stratum: String },

    #[error("stratum `{stratum}` needs at least {required} sites for {extrapolation} extrapolation, found {found}")]
    InsufficientSites {
        stratum: String,
        extrapolation: String,
        required: usize,
        found: usize,
    },

    #[error("matched samples for stratum `{stratum}` are not paired: {reason}")]
    PairingMismatch { stratum: String, reason: String },

    #[error("stratum `{stratum}` has {found} matched sites, regression needs at least 2")]
    InsufficientPairs { stratum: String, found: usize },

    #[error("the table `{table}` is missing site(s) {} for the year {year}", .sites.join(","))]
    MissingSiteInDataSource {
        table: String,
        year: i32,
        sites: Vec<String>,
    },

    #[error("no analysis stratum for geomorphic stratum `{geo}` and sampling stratum `{sampling}`")]
    UnknownStratumCombination { geo: String, sampling: String },

    #[error("stratum `{stratum}` appears more than once in the estimate")]
    DuplicateStratum { stratum: String },

    #[error("an estimate needs at least one sample")]
    NoSamples,

    #[error("strata do not line up: expected `{expected}`, found `{found}`")]
    StratumMismatch { expected: String, found: String },

    #[error("invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("data source query failed: {0}")]
    Query(String),

    #[error("survey year {year}: {source}")]
    Survey {
        year: i32,
        #[source]
        source: Box<Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    /// Attach the survey year to an error raised while processing that year
    #[must_use]
    pub fn in_year(self, year: i32) -> Self {
        match self {
            already @ Self::Survey { .. } => already,
            other => Self::Survey {
                year,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
