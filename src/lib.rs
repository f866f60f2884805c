//! Regional summaries of volumetric brain maps from ICA spatial components.
//!
//! A cohort of maps is decomposed into independent spatial components
//! ([`decompose`]); each component becomes a mask ([`mask`]); each subject's
//! map is reduced to one scalar inside that mask ([`reduce`]). The
//! [`pipeline`] drives this over all components and yields a
//! components × subjects [`ResultMatrix`](data::model::ResultMatrix).

pub mod config;
pub mod data;
pub mod decompose;
pub mod error;
pub mod mask;
pub mod pipeline;
pub mod reduce;
pub mod report;
pub mod stats;

pub use error::{Result, RoiError};
