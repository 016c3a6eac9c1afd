// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError carries owned messages
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Xainik payments API
//!
//! Receives Razorpay webhooks and exposes the admin routes operators use to
//! inspect and re-drive payment events.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
