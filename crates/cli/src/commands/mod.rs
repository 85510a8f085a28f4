//! CLI command implementations

pub mod baseline;
pub mod capture;
pub mod run;
