//! Application services and scheduled jobs.

pub mod error;
pub mod followers;
pub mod jobs;
pub mod repos;
