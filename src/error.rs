use thiserror::Error;

/// Why a send was rejected by the quota governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaReason {
    /// Partner has never replied in this room.
    BeforeReply,
    /// Counting my messages since the partner's last reply.
    AfterReply,
    /// Room is malformed and the partner id could not be resolved.
    MissingPartner,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("{collection}: record '{id}' does not exist")]
    NotFound { collection: &'static str, id: String },

    #[error("message quota exceeded ({0})")]
    QuotaExceeded(QuotaReason),

    #[error("persistence: {0}")]
    Persistence(String),

    /// Backend rejected a write because of one specific unknown field.
    /// The adapter strips the field and retries; callers only see this
    /// wrapped in `Persistence` once the retry limit is exhausted.
    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("backend: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("store has been shut down")]
    Closed,
}

impl std::fmt::Display for QuotaReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaReason::BeforeReply => write!(f, "before_reply"),
            QuotaReason::AfterReply => write!(f, "after_reply"),
            QuotaReason::MissingPartner => write!(f, "missing_partner"),
        }
    }
}
