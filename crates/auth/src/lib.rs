//! `genforge-auth`: bearer token boundary.
//!
//! Session management lives elsewhere; this crate only verifies the tokens it
//! issues and exposes who the caller is and which plan tier they are on.
//! It is intentionally decoupled from HTTP and storage.

pub mod claims;
pub mod validator;

pub use claims::{validate_claims, JwtClaims, TokenValidationError};
pub use validator::{Hs256JwtValidator, JwtValidator};
