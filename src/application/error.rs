use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    application::{jobs::ReconcileError, repos::RepoError},
    cache::PopularityError,
    infra::error::InfraError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Popularity(#[from] PopularityError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// The error followed by each of its sources, outermost first.
    pub fn chain(&self) -> Vec<String> {
        let mut messages = vec![self.to_string()];
        let mut current = self.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        messages.dedup();
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_lists_nested_sources() {
        let err = AppError::from(ReconcileError::Write {
            batch: 2,
            source: RepoError::Timeout,
        });

        let chain = err.chain();
        assert_eq!(chain.first().map(String::as_str), Some("durable write failed for batch 2"));
        assert!(chain.iter().any(|message| message == "database timeout"));
    }
}
