use thiserror::Error;

#[derive(Debug, Error)]
pub enum MempackError {
    #[error("missing required identifier: {0}")]
    MissingIdentifier(&'static str),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("query exceeds {max} characters (got {got})")]
    QueryTooLong { max: usize, got: usize },

    #[error("unknown embedding kind '{0}' (expected 'memory' or 'chunk')")]
    UnknownEmbeddingKind(String),

    #[error("summary update requires summary_tokens")]
    MissingSummaryTokens,

    #[error("memory {0} not found")]
    MemoryNotFound(String),

    #[error("memory {0} is deleted")]
    MemoryDeleted(String),

    #[error("chunk {0} not found")]
    ChunkNotFound(String),

    #[error("repository not found for '{0}'")]
    RepoNotFound(String),

    #[error("no state recorded for workspace '{0}'")]
    StateNotFound(String),

    #[error("link {from} -{rel}-> {to} would create a cycle")]
    LinkCycle {
        from: String,
        rel: String,
        to: String,
    },

    #[error("database is busy: {0}")]
    Busy(String),

    #[error("schema migration failed at version {version}: {message}")]
    Migration { version: i64, message: String },

    #[error("version control probe failed: {0}")]
    Vcs(#[from] git2::Error),

    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    #[error("embedding provider returned a malformed response: {0}")]
    EmbeddingResponse(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl MempackError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingIdentifier(_) => "missing_identifier",
            Self::InvalidQuery(_) => "invalid_query",
            Self::QueryTooLong { .. } => "query_too_long",
            Self::UnknownEmbeddingKind(_) => "unknown_embedding_kind",
            Self::MissingSummaryTokens => "missing_summary_tokens",
            Self::MemoryNotFound(_) => "memory_not_found",
            Self::MemoryDeleted(_) => "memory_deleted",
            Self::ChunkNotFound(_) => "chunk_not_found",
            Self::RepoNotFound(_) => "repo_not_found",
            Self::StateNotFound(_) => "state_not_found",
            Self::LinkCycle { .. } => "link_cycle",
            Self::Busy(_) => "database_busy",
            Self::Migration { .. } => "migration_failed",
            Self::Vcs(_) => "vcs_error",
            Self::EmbeddingProvider(_) => "embedding_provider_error",
            Self::EmbeddingResponse(_) => "embedding_malformed_response",
            Self::Config(_) => "invalid_config",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Db(_) => "db_error",
        }
    }

    /// Remediation hint for the user-facing surface. Empty when there is no
    /// action the user can sensibly take.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::QueryTooLong { .. } => "shorten the query below 4096 characters",
            Self::MissingSummaryTokens => "pass --summary-tokens alongside --summary",
            Self::Busy(_) => "another process holds the database; retry shortly",
            Self::Migration { .. } => "run `mempack doctor --fix` to repair the schema",
            Self::EmbeddingProvider(_) | Self::EmbeddingResponse(_) => {
                "check that the embedding server is running, or disable the provider"
            }
            Self::LinkCycle { .. } => "links must stay acyclic among active memories",
            _ => "",
        }
    }

    /// True for contention errors that a caller may retry.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Busy(_) => true,
            Self::Db(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MempackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            MempackError::MissingSummaryTokens.code(),
            "missing_summary_tokens"
        );
        assert_eq!(
            MempackError::QueryTooLong {
                max: 4096,
                got: 5000
            }
            .code(),
            "query_too_long"
        );
        assert_eq!(
            MempackError::MemoryNotFound("M-x".into()).code(),
            "memory_not_found"
        );
    }

    #[test]
    fn busy_detection_covers_sqlite_codes() {
        let err = MempackError::Db(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("locked".into()),
        ));
        assert!(err.is_busy());
        assert!(!MempackError::MissingSummaryTokens.is_busy());
    }
}
