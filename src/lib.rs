//! # Text Classifier
#![forbid(unsafe_code)]

/// Experiment configuration
pub mod config;

/// Per-run context (device, debug flag, credentials)
pub mod context;

/// Models
pub mod models;

/// Pipelines
pub mod pipelines;

/// Datasets
pub mod datasets;

/// Console reporting
pub mod report;

/// Experiment tracking
pub mod tracking;

/// Model publishing
pub mod publish;

/// Utilities
pub mod utils;

/// CLI indexes and utilities
pub mod cli;

/// Error macros
#[macro_use]
extern crate anyhow;
