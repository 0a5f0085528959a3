use thiserror::Error;

/// Failures while bringing up or talking to external services outside the
/// request path: pools, migrations, health checks, the tracing subscriber.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("postgres {stage} failed: {source}")]
    Postgres {
        stage: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("redis {stage} failed: {message}")]
    Redis { stage: &'static str, message: String },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("`{key}` is not configured")]
    MissingSetting { key: &'static str },
}

impl InfraError {
    pub fn postgres(stage: &'static str, source: sqlx::Error) -> Self {
        Self::Postgres { stage, source }
    }

    pub fn redis(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Redis {
            stage,
            message: err.to_string(),
        }
    }

    pub fn missing_setting(key: &'static str) -> Self {
        Self::MissingSetting { key }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
