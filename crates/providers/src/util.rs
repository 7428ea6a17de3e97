//! Shared helpers for provider adapters.

use hb_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
/// Timeouts map to [`Error::Timeout`]; everything else to [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve an API key from the configured environment variable.
pub(crate) fn resolve_api_key(env_var: Option<&str>) -> Result<String> {
    let var = env_var.ok_or_else(|| Error::Config("provider has no api_key_env".into()))?;
    std::env::var(var)
        .map_err(|_| Error::Config(format!("environment variable '{var}' not set")))
}

/// Whether the key for a provider config is available without constructing
/// the client.
pub(crate) fn key_available(env_var: Option<&str>) -> bool {
    match env_var {
        Some(var) => std::env::var(var).is_ok(),
        None => false,
    }
}
