#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

pub mod change;
pub mod config;
pub mod error;
pub mod estimate;
pub mod report;
pub mod sample;
pub mod simulation;
pub mod site;
pub mod source;
pub mod stratum;
pub mod survey;
pub mod units;

pub use error::{Error, Result};
