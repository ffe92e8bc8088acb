use crate::util::ControlPlaneError;
use std::collections::HashSet;
use std::net::IpAddr;

pub const MAX_NAME_LEN: usize = 64;
const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Node and cluster names double as replication tool aliases, so they are kept
/// to a shell-safe alphabet.
pub fn validate_name(value: &str, field: &str) -> Result<(), ControlPlaneError> {
    if value.is_empty() {
        return Err(ControlPlaneError::validation(format!(
            "{field} must not be empty"
        )));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(ControlPlaneError::validation(format!(
            "{field} must be <= {MAX_NAME_LEN} characters"
        )));
    }
    let mut chars = value.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(ControlPlaneError::validation(format!(
            "{field} must start with an ASCII letter or digit"
        )));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(ControlPlaneError::validation(format!(
            "{field} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// Accepts IPv4/IPv6 literals and RFC 1123 hostnames.
pub fn validate_address(value: &str) -> Result<(), ControlPlaneError> {
    if value.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if value.is_empty() || value.len() > MAX_HOSTNAME_LEN {
        return Err(ControlPlaneError::validation(format!(
            "address {value:?} is not a valid IP address or hostname"
        )));
    }
    let all_numeric = value.chars().all(|c| c.is_ascii_digit() || c == '.');
    let labels_ok = value.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if all_numeric || !labels_ok {
        return Err(ControlPlaneError::validation(format!(
            "address {value:?} is not a valid IP address or hostname"
        )));
    }
    Ok(())
}

pub fn validate_port(port: u16) -> Result<(), ControlPlaneError> {
    if port == 0 {
        return Err(ControlPlaneError::validation("port must be in 1..=65535"));
    }
    Ok(())
}

/// Formation needs at least two distinct, well-formed aliases.
pub fn validate_aliases(aliases: &[String]) -> Result<(), ControlPlaneError> {
    if aliases.len() < 2 {
        return Err(ControlPlaneError::validation(format!(
            "cluster requires at least 2 aliases, got {}",
            aliases.len()
        )));
    }
    let mut seen = HashSet::with_capacity(aliases.len());
    for alias in aliases {
        validate_name(alias, "alias")?;
        if !seen.insert(alias.as_str()) {
            return Err(ControlPlaneError::validation(format!(
                "alias '{alias}' listed more than once"
            )));
        }
    }
    Ok(())
}

/// Splits the comma-separated alias form, trimming entries and dropping empties.
pub fn parse_alias_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|alias| !alias.is_empty())
        .map(str::to_string)
        .collect()
}
