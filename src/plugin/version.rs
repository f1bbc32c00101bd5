//! Semantic version helpers for plugins and repositories

use std::cmp::Ordering;

use semver::Version;

use crate::core::error::{MangoError, Result};

/// Plugin API version implemented by this host
pub const API_VERSION: &str = "1.0";

/// Parse a version leniently: a leading `v` is ignored and missing minor or
/// patch components are treated as zero (`"1.2"` → `1.2.0`).
pub fn parse_version(version: &str) -> Result<Version> {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(MangoError::InvalidVersion(format!("{:?}", version)));
    }

    // Split off pre-release / build suffixes before padding the core
    let split = trimmed.find(|c| c == '-' || c == '+').unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);
    let padded = match core.split('.').count() {
        1 => format!("{}.0.0{}", core, suffix),
        2 => format!("{}.0{}", core, suffix),
        _ => trimmed.to_string(),
    };

    Version::parse(&padded)
        .map_err(|e| MangoError::InvalidVersion(format!("{:?}: {}", version, e)))
}

/// Compare two versions; build metadata is ignored
///
/// # Errors
/// An invalid version on either side is an error, never a comparison result.
pub fn compare_versions(v1: &str, v2: &str) -> Result<Ordering> {
    let a = parse_version(v1)?;
    let b = parse_version(v2)?;
    Ok(a.cmp_precedence(&b))
}

/// Whether `candidate` is strictly newer than `current`
pub fn is_newer_version(current: &str, candidate: &str) -> Result<bool> {
    Ok(compare_versions(current, candidate)? == Ordering::Less)
}

pub fn is_valid_version(version: &str) -> bool {
    parse_version(version).is_ok()
}

/// Exact-match API compatibility check
pub fn validate_api_version(plugin_api_version: &str) -> Result<()> {
    if plugin_api_version != API_VERSION {
        return Err(MangoError::IncompatibleApiVersion(format!(
            "plugin requires API version {}, but this host provides {}",
            plugin_api_version, API_VERSION
        )));
    }
    Ok(())
}
