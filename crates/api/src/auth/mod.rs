//! Identity primitives.
//!
//! Users are authenticated by an external issuer; this service only
//! validates the HS256 access tokens it hands out ([`jwt`]).

pub mod jwt;
