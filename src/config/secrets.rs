//! Secret handling utilities.
//!
//! Re-exports secrecy types and builds sensitive header values so a bearer
//! token never shows up in `Debug` output of a request.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

use reqwest::header::HeaderValue;

/// Build an `Authorization: Bearer …` header value marked sensitive.
pub fn bearer_header(token: &SecretString) -> Option<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret())).ok()?;
    value.set_sensitive(true);
    Some(value)
}
