//! Secret redaction for key material and credentialed endpoints.
//!
//! Use [`Redacted`] to wrap values that must never appear in logs, error
//! messages, or serialized output. [`redact_url`] strips credentials, paths,
//! and query strings from RPC URLs, where providers commonly embed API keys.

use std::fmt::{self, Debug, Display};

/// Wrapper that redacts its inner value when formatted or serialized.
///
/// ```ignore
/// use gateway_bridge::redact::Redacted;
///
/// tracing::info!(key = %Redacted(&private_key), "Loaded signer");
/// // Logs: key = <redacted>
/// ```
#[derive(Clone, Copy)]
pub struct Redacted<T>(pub T);

impl<T> Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> serde::Serialize for Redacted<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        "<redacted>".serialize(serializer)
    }
}

/// Render an RPC URL as `scheme://host[:port]`, dropping anything that may
/// carry an API key. Unparseable input is fully redacted.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}://{}:{}", parsed.scheme(), host, port),
            (Some(host), None) => format!("{}://{}", parsed.scheme(), host),
            _ => "<redacted>".to_string(),
        },
        Err(_) => "<redacted>".to_string(),
    }
}
