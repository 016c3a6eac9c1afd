//! Authentication module for the admin API

pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use middleware::{require_admin_token, AdminAuth, AuthError};
