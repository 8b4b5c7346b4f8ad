//! Input validation utilities.
//!
//! Centralized validation helpers used across API routes and the peer registry.

use validator::Validate;

use crate::error::MeridianError;

/// Validate a request body, returning a MeridianError::Validation on failure.
pub fn validate_request<T: Validate>(body: &T) -> Result<(), MeridianError> {
    body.validate().map_err(|e| MeridianError::Validation {
        message: format_validation_errors(e),
    })
}

/// Format validation errors into a human-readable string.
fn format_validation_errors(errors: validator::ValidationErrors) -> String {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                e.message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Invalid value for '{field}'"))
            })
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Normalise and validate a federation server name.
///
/// Accepts `host` or `host:port` where host is a DNS name or IP literal.
/// Returns the lowercase form used as the registry key.
pub fn normalize_domain(domain: &str) -> Result<String, MeridianError> {
    let trimmed = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if trimmed.is_empty() || trimmed.len() > 253 {
        return Err(MeridianError::Validation {
            message: "Server name must be 1-253 characters".into(),
        });
    }
    if trimmed.contains(['/', '@', '?', '#', ' ']) {
        return Err(MeridianError::Validation {
            message: format!("'{domain}' is not a valid server name"),
        });
    }

    // Let the URL parser do host validation, including IPv6 literals.
    let parsed = url::Url::parse(&format!("https://{trimmed}/")).map_err(|_| {
        MeridianError::Validation { message: format!("'{domain}' is not a valid server name") }
    })?;
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(MeridianError::Validation {
            message: format!("'{domain}' is not a valid server name"),
        });
    }

    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_are_lowercased_and_trimmed() {
        assert_eq!(normalize_domain(" Chat.Example.ORG. ").unwrap(), "chat.example.org");
        assert_eq!(normalize_domain("chat.example.org:8448").unwrap(), "chat.example.org:8448");
        assert_eq!(normalize_domain("[::1]:8448").unwrap(), "[::1]:8448");
    }

    #[test]
    fn malformed_domains_are_rejected() {
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("evil.example/path").is_err());
        assert!(normalize_domain("user@host").is_err());
        assert!(normalize_domain("a b").is_err());
    }
}
