use crate::job::JobStatus;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Internal error: {0}")]
    Internal(String),
}
