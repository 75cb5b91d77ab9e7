use uuid::Uuid;

/// Result type alias for clustering operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Another pass holds the partition lock. Retry on the next schedule tick.
    #[error("Partition lock conflict: another clustering pass is running for CTM {0}")]
    LockConflict(Uuid),

    #[error("CTM not found: {0}")]
    CtmNotFound(Uuid),

    /// No weight table for the CTM's track. Fatal for the current pass.
    #[error("No weight table configured for track '{track}' (CTM {ctm_id})")]
    UnknownTrack { track: String, ctm_id: Uuid },

    #[error("Topic {topic_id} does not belong to CTM {ctm_id}")]
    TopicNotInCtm { topic_id: Uuid, ctm_id: Uuid },

    #[error("Headline {headline_id} has no membership in CTM {ctm_id}")]
    NotLinked { headline_id: Uuid, ctm_id: Uuid },

    #[error("Configuration error: {0}")]
    Config(#[from] storyline_common::StorylineError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt stored value: {0}")]
    Decode(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClusterError {
    /// Errors that defer the pass instead of failing it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::LockConflict(_))
    }
}
