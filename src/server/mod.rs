//! HTTP server.
//!
//! - [`api`]: Router, route handlers and API errors
//! - [`streaming`]: Relay of backend chunks into the response body

pub mod api;
pub mod streaming;
