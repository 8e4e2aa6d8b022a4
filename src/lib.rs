//! Category-path normalization and skin-concern inference over dated
//! catalog snapshots.

pub mod category;
pub mod config;
pub mod error;
pub mod frames;
pub mod logging;
pub mod models;
pub mod official;
pub mod payload;
pub mod pipeline;
pub mod resolver;
pub mod scoring;
pub mod snapshot;
pub mod value_utils;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{Pipeline, Table};
