//! feedtally: engagement counters kept hot in Redis and reconciled into Postgres.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
