//! Input validation for quota specifications and reservation requests

use quotaplane_common::{Cap, Error, QuotaLimit, QuotaSpecification, ReservationRequest};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Maximum allowed lengths for various fields
pub const MAX_NAME_LENGTH: usize = 128;
pub const MAX_SCOPE_LENGTH: usize = 128;
pub const MAX_DESCRIPTION_LENGTH: usize = 1000;

static QUOTA_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9-]{1,128}$").unwrap()
});

static SCOPE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9_.-]+$").unwrap()
});

/// Validation result type
pub type ValidationResult<T> = Result<T, Error>;

/// Quota name validation
pub fn validate_quota_name(name: &str) -> ValidationResult<()> {
    if name.is_empty() {
        return Err(Error::Validation("quota name cannot be empty".to_string()));
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "quota name too long (max {} characters)",
            MAX_NAME_LENGTH
        )));
    }

    if !QUOTA_NAME_REGEX.is_match(name) {
        return Err(Error::Validation(format!(
            "invalid quota name '{}': only alphanumeric characters and hyphens are allowed",
            name
        )));
    }

    Ok(())
}

/// Scope (region/partition) validation
pub fn validate_scope(scope: &str) -> ValidationResult<()> {
    if scope.is_empty() {
        return Err(Error::Validation("scope cannot be empty".to_string()));
    }

    if scope.len() > MAX_SCOPE_LENGTH {
        return Err(Error::Validation(format!(
            "scope too long (max {} characters)",
            MAX_SCOPE_LENGTH
        )));
    }

    if !SCOPE_REGEX.is_match(scope) {
        return Err(Error::Validation(format!(
            "invalid scope '{}': only alphanumeric characters, '.', '_' and '-' are allowed",
            scope
        )));
    }

    Ok(())
}

pub fn validate_description(description: Option<&str>) -> ValidationResult<()> {
    match description {
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LENGTH => Err(Error::Validation(format!(
            "description too long (max {} characters)",
            MAX_DESCRIPTION_LENGTH
        ))),
        _ => Ok(()),
    }
}

fn validate_limit(limit: &QuotaLimit) -> ValidationResult<()> {
    validate_scope(&limit.scope)?;
    validate_description(limit.description.as_deref())?;

    for (dimension, cap) in &limit.caps {
        if let Cap::Limited(n) = cap {
            if *n < 0 {
                return Err(Error::Validation(format!(
                    "cap for {} in scope '{}' cannot be negative (got {})",
                    dimension, limit.scope, n
                )));
            }
        }
    }

    Ok(())
}

/// Structural validation of a specification before it is stored
pub fn validate_specification(spec: &QuotaSpecification, max_limits: usize) -> ValidationResult<()> {
    validate_quota_name(&spec.name)?;
    validate_description(spec.description.as_deref())?;

    if spec.limits.is_empty() {
        return Err(Error::Validation(format!(
            "quota '{}' must declare at least one limit",
            spec.name
        )));
    }

    if spec.limits.len() > max_limits {
        return Err(Error::Validation(format!(
            "quota '{}' declares {} limits (max {})",
            spec.name,
            spec.limits.len(),
            max_limits
        )));
    }

    let mut seen = HashSet::new();
    for limit in &spec.limits {
        validate_limit(limit)?;
        if !seen.insert(limit.scope.as_str()) {
            return Err(Error::Validation(format!(
                "quota '{}' declares scope '{}' more than once",
                spec.name, limit.scope
            )));
        }
    }

    Ok(())
}

/// Reservation request validation
pub fn validate_request(request: &ReservationRequest) -> ValidationResult<()> {
    validate_quota_name(&request.quota)?;
    validate_scope(&request.scope)?;

    if request.resources.is_zero() {
        return Err(Error::Validation(format!(
            "reservation against '{}' requests no resources",
            request.quota
        )));
    }

    Ok(())
}
