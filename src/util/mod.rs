//! Small utilities: identifier validation and id minting.

pub mod id;

/// Longest accepted project/session/operator identifier.
pub const MAX_ID_LEN: usize = 64;

/// Validate an identifier that will be embedded in file paths or container labels.
///
/// Accepts ASCII alphanumerics, `-` and `_`. Keep error text stable (HTTP responses carry it).
pub fn validate_resource_id(s: &str, what: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err(format!("{what} is required"));
    }
    if s.len() > MAX_ID_LEN {
        return Err(format!("{what} is too long (max {MAX_ID_LEN})"));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(format!("{what} contains invalid characters"));
    }
    Ok(())
}
