//! # jobhub-core
//!
//! Core crate for JobHub. Contains configuration schemas, the job
//! specification model and validator, and the unified error system.
//!
//! This crate has **no** internal dependencies on other JobHub crates.

pub mod config;
pub mod error;
pub mod job;
pub mod result;

pub use error::{AppError, ErrorKind};
pub use job::{CronEntry, JobBody, JobSpec, TaskMap};
pub use result::AppResult;
