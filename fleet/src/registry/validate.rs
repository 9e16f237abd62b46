//! Target field validation. Purely local, never touches the network.

use crate::errors::FleetError;
use crate::models::target::NewTarget;

const MAX_HOST_LEN: usize = 253;
const MAX_USERNAME_LEN: usize = 32;

/// Validate every field of a new target, failing on the first bad one
pub fn validate_new_target(target: &NewTarget) -> Result<(), FleetError> {
    validate_name(&target.name)?;
    validate_host(&target.host)?;
    validate_username(&target.username)?;
    validate_key_locator(&target.key_locator)?;
    Ok(())
}

pub fn validate_name(name: &str) -> Result<(), FleetError> {
    if name.trim().is_empty() {
        return Err(FleetError::validation("name", "cannot be empty"));
    }
    Ok(())
}

/// Hostname or IP address: letters, digits, `.` and `-`
pub fn validate_host(host: &str) -> Result<(), FleetError> {
    if host.is_empty() {
        return Err(FleetError::validation("host", "cannot be empty"));
    }
    if host.len() > MAX_HOST_LEN {
        return Err(FleetError::validation(
            "host",
            format!("longer than {} characters", MAX_HOST_LEN),
        ));
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(FleetError::validation(
            "host",
            format!("invalid host format: {:?}", host),
        ));
    }
    Ok(())
}

/// POSIX-style login name: `[a-z_][a-z0-9_-]*`
pub fn validate_username(username: &str) -> Result<(), FleetError> {
    let mut chars = username.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return Err(FleetError::validation("username", "cannot be empty")),
    };
    if username.len() > MAX_USERNAME_LEN {
        return Err(FleetError::validation(
            "username",
            format!("longer than {} characters", MAX_USERNAME_LEN),
        ));
    }

    let valid_first = first.is_ascii_lowercase() || first == '_';
    let valid_rest =
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid_first || !valid_rest {
        return Err(FleetError::validation(
            "username",
            format!("invalid username format: {:?}", username),
        ));
    }
    Ok(())
}

pub fn validate_key_locator(key_locator: &str) -> Result<(), FleetError> {
    if key_locator.trim().is_empty() {
        return Err(FleetError::validation("key_locator", "cannot be empty"));
    }
    Ok(())
}
