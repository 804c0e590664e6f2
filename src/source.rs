//! The contract between the estimators and the spatial/tabular data they are computed from.
//!
//! Estimation only needs two kinds of query: attribute rows keyed by an identifier field, and
//! aggregates (feature count and summed geometry) over a filtered feature class. How those are
//! answered is left to the implementor; [`MemorySource`] answers them from tables held in memory,
//! optionally loaded from CSV files.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Read;
use std::path::Path;

use itertools::Itertools;

use crate::{Error, Result};

/// A single attribute value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Number(f64),
    Text(String),
}

impl Value {
    /// Infer the type of a raw text cell.
    ///
    /// Zero-padded cells such as `007` are codes rather than numbers and stay text.
    #[must_use]
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Self::Null
        } else if is_zero_padded(trimmed) {
            Self::Text(trimmed.to_owned())
        } else if let Ok(integer) = trimmed.parse::<i64>() {
            Self::Integer(integer)
        } else if let Ok(number) = trimmed.parse::<f64>() {
            Self::Number(number)
        } else {
            Self::Text(trimmed.to_owned())
        }
    }

    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Number(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
            Self::Null => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The value as a key, as used for site identifiers
    #[must_use]
    pub fn to_key(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Integer(value) => Some(value.to_string()),
            Self::Number(value) => Some(value.to_string()),
            Self::Text(text) => Some(text.clone()),
        }
    }

    fn loosely_equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Null, Self::Null) => true,
            // CSV backends cannot tell an empty string from a missing one
            (Self::Null, Self::Text(text)) | (Self::Text(text), Self::Null) => text.is_empty(),
            (Self::Null, _) | (_, Self::Null) => false,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                _ => a.to_key() == b.to_key(),
            },
        }
    }
}

fn is_zero_padded(text: &str) -> bool {
    let mut digits = text.trim_start_matches(['+', '-']).chars();
    digits.next() == Some('0') && digits.next().is_some_and(|c| c.is_ascii_digit())
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(text) => write!(f, "'{}'", text.replace('\'', "''")),
        }
    }
}

pub type Record = BTreeMap<String, Value>;

static NULL: Value = Value::Null;

/// A structured where clause.
///
/// Backends speaking a query language can render it with [`fmt::Display`]; in-memory backends
/// evaluate it with [`Filter::matches`].
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    NotEq(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    /// A date field falls within the calendar year
    InYear(String, i32),
    And(Vec<Filter>),
}

impl Filter {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn not_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::NotEq(field.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn not_in<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::NotIn(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn in_year(field: impl Into<String>, year: i32) -> Self {
        Self::InYear(field.into(), year)
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, other) | (other, Self::All) => other,
            (Self::And(mut clauses), Self::And(more)) => {
                clauses.extend(more);
                Self::And(clauses)
            }
            (Self::And(mut clauses), other) => {
                clauses.push(other);
                Self::And(clauses)
            }
            (this, other) => Self::And(vec![this, other]),
        }
    }

    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        let field = |name: &str| record.get(name).unwrap_or(&NULL);
        match self {
            Self::All => true,
            Self::Eq(name, value) => field(name).loosely_equals(value),
            Self::NotEq(name, value) => !field(name).loosely_equals(value),
            Self::In(name, values) => values.iter().any(|v| field(name).loosely_equals(v)),
            Self::NotIn(name, values) => !values.iter().any(|v| field(name).loosely_equals(v)),
            Self::InYear(name, year) => year_of(field(name)) == Some(*year),
            Self::And(clauses) => clauses.iter().all(|clause| clause.matches(record)),
        }
    }
}

/// The calendar year of a date value, either a bare year or text starting `YYYY-`
fn year_of(value: &Value) -> Option<i32> {
    match value {
        Value::Integer(year) => i32::try_from(*year).ok(),
        Value::Text(text) => text.get(..4).and_then(|year| year.parse().ok()),
        _ => None,
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("1 = 1"),
            Self::Eq(name, value) => write!(f, "\"{name}\" = {value}"),
            Self::NotEq(name, value) => write!(f, "\"{name}\" <> {value}"),
            Self::In(name, values) => write!(f, "\"{name}\" in ({})", values.iter().join(",")),
            Self::NotIn(name, values) => {
                write!(f, "\"{name}\" not in ({})", values.iter().join(","))
            }
            Self::InYear(name, year) => write!(
                f,
                "\"{name}\" >= #01-01-{year}# and \"{name}\" <= #12-31-{year}#"
            ),
            Self::And(clauses) => write!(f, "{}", clauses.iter().join(" and ")),
        }
    }
}

/// Aggregates over the features matching a query
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureSummary {
    pub record_count: usize,
    /// Summed area (polygons) or length (lines) of the matching features
    pub geometry_sum: f64,
    pub linear_units: String,
}

pub trait DataSource {
    /// Return `fields` for each record of `table` matching `filter`, keyed by `key_field`.
    ///
    /// # Errors
    /// Returns an error if the table or any requested field does not exist.
    fn query_table(
        &self,
        table: &str,
        filter: &Filter,
        fields: &[&str],
        key_field: &str,
    ) -> Result<BTreeMap<String, Vec<Value>>>;

    /// Count and sum the geometry of the features in `feature_class` matching `filter`.
    ///
    /// # Errors
    /// Returns an error if the feature class does not exist.
    fn query_features(&self, feature_class: &str, filter: &Filter) -> Result<FeatureSummary>;
}

#[derive(Clone, Debug, PartialEq)]
struct Geometry {
    /// The field holding each feature's area or length
    measure_field: String,
    linear_units: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryTable {
    records: Vec<Record>,
    geometry: Option<Geometry>,
}

impl MemoryTable {
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            geometry: None,
        }
    }

    /// Read a table from CSV with a header row, inferring the type of every cell
    ///
    /// # Errors
    /// Returns an error if the CSV is malformed.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();

        let mut records = vec![];
        for result in rdr.records() {
            let row = result?;
            let record = headers
                .iter()
                .zip(row.iter())
                .map(|(name, cell)| (name.to_owned(), Value::infer(cell)))
                .collect::<Record>();
            records.push(record);
        }

        Ok(Self::new(records))
    }

    /// # Errors
    /// Returns an error if the file cannot be read or is malformed.
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// Treat the table as a feature class whose geometry measure is stored in `measure_field`
    #[must_use]
    pub fn with_geometry(
        mut self,
        measure_field: impl Into<String>,
        linear_units: impl Into<String>,
    ) -> Self {
        self.geometry = Some(Geometry {
            measure_field: measure_field.into(),
            linear_units: linear_units.into(),
        });
        self
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A [`DataSource`] over tables held in memory
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    tables: HashMap<String, MemoryTable>,
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, table: MemoryTable) {
        self.tables.insert(name.into(), table);
    }

    #[must_use]
    pub fn with_table(mut self, name: impl Into<String>, table: MemoryTable) -> Self {
        self.insert(name, table);
        self
    }

    fn table(&self, name: &str) -> Result<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::Query(format!("table `{name}` does not exist")))
    }
}

impl DataSource for MemorySource {
    fn query_table(
        &self,
        table: &str,
        filter: &Filter,
        fields: &[&str],
        key_field: &str,
    ) -> Result<BTreeMap<String, Vec<Value>>> {
        let mut results = BTreeMap::new();
        for record in self.table(table)?.records.iter().filter(|r| filter.matches(r)) {
            let Some(key) = record.get(key_field).and_then(Value::to_key) else {
                return Err(Error::Query(format!(
                    "record in `{table}` has no value for key field `{key_field}`"
                )));
            };
            let values = fields
                .iter()
                .map(|name| {
                    record.get(*name).cloned().ok_or_else(|| {
                        Error::Query(format!("field `{name}` does not exist in `{table}`"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            results.insert(key, values);
        }
        Ok(results)
    }

    fn query_features(&self, feature_class: &str, filter: &Filter) -> Result<FeatureSummary> {
        let table = self.table(feature_class)?;
        let geometry = table.geometry.as_ref().ok_or_else(|| {
            Error::Query(format!("`{feature_class}` is not a feature class"))
        })?;

        let matching = table
            .records
            .iter()
            .filter(|record| filter.matches(record))
            .collect::<Vec<_>>();
        let geometry_sum = matching
            .iter()
            .filter_map(|record| record.get(&geometry.measure_field).and_then(Value::as_f64))
            .sum();

        Ok(FeatureSummary {
            record_count: matching.len(),
            geometry_sum,
            linear_units: geometry.linear_units.clone(),
        })
    }
}

/// Build a [`Record`] from field/value pairs
#[macro_export]
macro_rules! record {
    ($($field:expr => $value:expr),* $(,)?) => {{
        let mut record = $crate::source::Record::new();
        $(record.insert(::std::string::String::from($field), $crate::source::Value::from($value));)*
        record
    }};
}
