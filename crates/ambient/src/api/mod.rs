//! HTTP API module.
//!
//! Session-scoped AG-UI endpoints plus a public health check.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
