//! Health check error types.

use thiserror::Error;

/// Errors surfaced by the health scheduler.
///
/// An unhealthy tunnel is not an error: it is reported as a
/// [`CheckOutcome`](crate::CheckOutcome) and through `on_error`.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("check superseded by a newer request")]
    Superseded,

    #[error("check callback panicked: {0}")]
    Callback(String),

    #[error("check task failed: {0}")]
    Task(String),

    #[error("state store error: {0}")]
    State(#[from] tunwatch_state::StateError),

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

pub type HealthResult<T> = Result<T, HealthError>;
