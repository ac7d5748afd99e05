// Error kinds per §7. Grounded in squall's `SquallError` shape: a flat
// thiserror enum with a user-facing message method, rather than one type
// per subsystem.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SectorFluxError {
    /// Store open or schema creation failed. Fatal to process startup.
    #[error("failed to initialize store: {0}")]
    Init(String),

    /// Upstream connection refused or timed out.
    #[error("upstream connect/timeout error: {0}")]
    Upstream(String),

    /// A row failed to write. Logged and dropped; never client-visible.
    #[error("store write failed: {0}")]
    Write(String),

    /// Bad JSON on an admin endpoint or chat turn.
    #[error("{0}")]
    ClientInput(String),
}

impl IntoResponse for SectorFluxError {
    fn into_response(self) -> Response {
        match self {
            SectorFluxError::ClientInput(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
        }
    }
}
