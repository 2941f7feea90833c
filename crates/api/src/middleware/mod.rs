//! Request extractors.
//!
//! - [`auth::AuthUser`] -- the caller identity from a Bearer token.

pub mod auth;
