use thiserror::Error;

/// The error taxonomy from §7: each variant maps to a propagation policy the
/// worker applies uniformly rather than matching on error type ad hoc at
/// each call site (see [`IngestError::is_retryable`]).
#[derive(Error, Debug)]
pub enum IngestError {
    /// Caller bug. Rejected at ingress with 400; never enqueued.
    #[error("validation error: {0}")]
    Validation(String),

    /// Store/LLM/embedder timeout or 5xx. Task not acked; re-delivered after VT.
    #[error("transient adapter error: {0}")]
    TransientAdapter(String),

    /// LLM output did not validate against schema after N retries.
    #[error("schema error: {0}")]
    Schema(String),

    /// Optimistic-CAS loss during resolution.
    #[error("conflict error: {0}")]
    Conflict(String),

    /// Group deleted mid-task, foreign-key missing, or similar unrecoverable state.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// A dispatcher internal handler threw. Logged and counted; never
    /// propagated to the task that triggered the event.
    #[error("handler error: {0}")]
    Handler(String),

    #[error("graph store error: {0}")]
    Graph(#[from] neo4rs::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    /// Whether the worker should leave the task un-acked (to be re-delivered
    /// after the visibility timeout) rather than dead-lettering it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::TransientAdapter(_)
                | IngestError::Conflict(_)
                | IngestError::Graph(_)
                | IngestError::Database(_)
                | IngestError::Http(_)
        )
    }

    /// The dead-letter reason string recorded alongside the original payload.
    pub fn dead_letter_reason(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
