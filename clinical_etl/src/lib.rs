//! Cleaning and merge engine for clinical extracts.
//!
//! Five raw extracts (demographics, visits, lab results, medications and
//! physician assignments) are loaded and cleaned one by one. They are then
//! left-joined onto the demographics roster and written to CSV, Parquet or SQLite.

pub mod annotator;
pub mod cleaner;
pub mod common;
pub mod config;
pub mod constants;
pub mod error;
pub mod loader;
pub mod merge;
pub mod null_audit;
pub mod parquet_writer;
pub mod pipeline;
pub mod rejects;
pub mod schema;
pub mod sink;
pub mod table;
pub mod units;
