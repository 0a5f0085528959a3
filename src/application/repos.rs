//! Repository traits describing the durable-store contract.
//!
//! The durable store is the system of record. Components read authoritative
//! values, upsert counters, commit batches transactionally and
//! compare-and-delete through these traits only.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::entities::{FollowerInfo, TagCount, TrendingTopic, ViewCounter};
use crate::domain::values::TagName;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[async_trait]
pub trait FollowersRepo: Send + Sync {
    /// Follower count of `user_id` and whether `viewer_id` follows them.
    /// An anonymous viewer never follows anyone.
    async fn follower_info(
        &self,
        user_id: &str,
        viewer_id: Option<&str>,
    ) -> Result<FollowerInfo, RepoError>;
}

#[async_trait]
pub trait TagsRepo: Send + Sync {
    /// Create the row with count 1 or add one to it; returns the new count.
    async fn increment_tag(&self, name: &TagName) -> Result<u64, RepoError>;

    /// Subtract one, never going below zero; a missing row reads as zero.
    async fn decrement_tag(&self, name: &TagName) -> Result<u64, RepoError>;

    /// Delete the row only if its count is zero and no post references the
    /// name. Returns whether a row was deleted.
    async fn delete_tag_if_unused(&self, name: &TagName) -> Result<bool, RepoError>;

    /// Tags whose count is greater than zero.
    async fn list_active_tags(&self) -> Result<Vec<TagCount>, RepoError>;

    /// Names with a positive count or at least one referencing post.
    async fn list_searchable_tag_names(&self) -> Result<Vec<String>, RepoError>;
}

#[async_trait]
pub trait ViewsRepo: Send + Sync {
    /// Persist absolute view counts in one transaction.
    async fn write_view_counts(&self, counts: &[ViewCounter]) -> Result<(), RepoError>;

    /// Persisted counts for the given posts; posts without a row are absent.
    async fn read_view_counts(&self, post_ids: &[String]) -> Result<HashMap<String, u64>, RepoError>;
}

/// Computes the current trending hashtags.
#[async_trait]
pub trait TrendingSource: Send + Sync {
    /// Hashtags on posts created at or after `since`, most used first.
    async fn trending_topics(
        &self,
        since: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<TrendingTopic>, RepoError>;
}
