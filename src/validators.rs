//! Input validation and sanitization for names, labels and descriptions
//!
//! Rule match criteria are checked by [`crate::core::validate`]; this module
//! covers the free-text fields that end up in rendered comments, audit events
//! and store files.

use ipnetwork::IpNetwork;

/// Maximum label length in bytes
pub const MAX_LABEL_LEN: usize = 64;
/// Maximum firewall / policy name length in characters
pub const MAX_NAME_LEN: usize = 100;
/// Maximum firewall scope length in characters
pub const MAX_SCOPE_LEN: usize = 50;
/// Maximum description length in characters
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Sanitizes a label for safe use in rendered rule comments.
///
/// Removes control characters, quotes, and shell metacharacters, keeping at
/// most [`MAX_LABEL_LEN`] ASCII characters.
///
/// # Examples
///
/// ```
/// use fireflow::validators::sanitize_label;
///
/// assert_eq!(sanitize_label("Web ingress"), "Web ingress");
///
/// let safe = sanitize_label("Test\nNewline\"Quote");
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_label(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':'))
        .take(MAX_LABEL_LEN)
        .collect()
}

/// Validates a rule label.
///
/// Unlike [`sanitize_label`] this refuses input instead of repairing it, so the
/// stored label is exactly what the caller sent.
///
/// # Errors
///
/// Returns `Err` if the label is longer than [`MAX_LABEL_LEN`] or contains
/// characters [`sanitize_label`] would strip.
pub fn validate_label(input: &str) -> Result<(), String> {
    if input.len() > MAX_LABEL_LEN {
        return Err(format!("too long (max {MAX_LABEL_LEN} characters)"));
    }
    if sanitize_label(input) != input {
        return Err("contains characters outside [A-Za-z0-9 -_.:]".to_string());
    }
    Ok(())
}

/// Validates a firewall or policy name and returns it trimmed.
///
/// # Errors
///
/// Returns `Err` if the trimmed name is empty, longer than [`MAX_NAME_LEN`],
/// or contains control characters.
pub fn validate_name(input: &str) -> Result<String, String> {
    let name = input.trim();
    if name.is_empty() {
        return Err("cannot be empty".to_string());
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(format!("too long (max {MAX_NAME_LEN} characters)"));
    }
    if name.chars().any(char::is_control) {
        return Err("contains control characters".to_string());
    }
    Ok(name.to_string())
}

/// Validates a firewall scope (free-form grouping such as a site or zone).
///
/// # Errors
///
/// Returns `Err` if the scope is longer than [`MAX_SCOPE_LEN`] or contains
/// characters other than ASCII alphanumerics, dot, dash, underscore and slash.
pub fn validate_scope(input: &str) -> Result<String, String> {
    let scope = input.trim();
    if scope.len() > MAX_SCOPE_LEN {
        return Err(format!("too long (max {MAX_SCOPE_LEN} characters)"));
    }
    if !scope
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/'))
    {
        return Err("contains invalid characters".to_string());
    }
    Ok(scope.to_string())
}

/// Validates an optional description. Blank descriptions become `None`.
///
/// # Errors
///
/// Returns `Err` if the description exceeds [`MAX_DESCRIPTION_LEN`] characters.
pub fn validate_description(input: Option<&str>) -> Result<Option<String>, String> {
    let Some(text) = input.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    if text.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(format!("too long (max {MAX_DESCRIPTION_LEN} characters)"));
    }
    Ok(Some(text.to_string()))
}

/// Returns an informational note for well-known or privileged ports.
///
/// Never blocks compilation; the CLI prints these alongside the report.
pub fn check_well_known_port(port: u16) -> Option<String> {
    let name = match port {
        22 => "SSH",
        25 => "SMTP",
        53 => "DNS",
        80 => "HTTP",
        443 => "HTTPS",
        3389 => "RDP",
        p if p < 1024 => return Some(format!("port {p} is privileged")),
        _ => return None,
    };
    Some(format!("port {port} is {name}"))
}

/// Returns an informational note when a network lies in a special-purpose range.
pub fn check_reserved_ip(network: &IpNetwork) -> Option<String> {
    use std::net::IpAddr;

    match network.ip() {
        IpAddr::V4(v4) if v4.is_private() => {
            Some(format!("{network} is a private range (RFC 1918)"))
        }
        IpAddr::V4(v4) if v4.is_loopback() => Some(format!("{network} is loopback")),
        IpAddr::V4(v4) if v4.is_link_local() => Some(format!("{network} is link-local")),
        IpAddr::V6(v6) if v6.is_loopback() => Some(format!("{network} is loopback")),
        IpAddr::V6(v6) if v6.segments()[0] & 0xffc0 == 0xfe80 => {
            Some(format!("{network} is link-local"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_label_removes_control_and_quotes() {
        assert_eq!(sanitize_label("Test\nNewline"), "TestNewline");
        assert_eq!(sanitize_label("Test\"Quote"), "TestQuote");
        assert_eq!(sanitize_label("Test$Dollar`tick"), "TestDollartick");
    }

    #[test]
    fn test_sanitize_label_length_limit() {
        assert_eq!(sanitize_label(&"a".repeat(100)).len(), MAX_LABEL_LEN);
    }

    #[test]
    fn test_validate_label() {
        assert!(validate_label("").is_ok());
        assert!(validate_label("Allow HTTPS: web-01").is_ok());
        assert!(validate_label(&"a".repeat(65)).is_err());
        assert!(validate_label("drop; rm -rf").is_err());
        assert!(validate_label("caf\u{e9}").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("  edge-fw  ").unwrap(), "edge-fw");
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(101)).is_err());
        assert!(validate_name(&"x".repeat(100)).is_ok());
        assert!(validate_name("bad\u{7}name").is_err());
    }

    #[test]
    fn test_validate_scope() {
        assert_eq!(validate_scope("dc1/dmz").unwrap(), "dc1/dmz");
        assert!(validate_scope("").is_ok());
        assert!(validate_scope(&"s".repeat(51)).is_err());
        assert!(validate_scope("dc 1").is_err());
    }

    #[test]
    fn test_validate_description() {
        assert_eq!(validate_description(None).unwrap(), None);
        assert_eq!(validate_description(Some("  ")).unwrap(), None);
        assert_eq!(
            validate_description(Some(" edge ")).unwrap(),
            Some("edge".to_string())
        );
        assert!(validate_description(Some(&"d".repeat(501))).is_err());
    }

    #[test]
    fn test_check_well_known_port() {
        assert_eq!(check_well_known_port(22).unwrap(), "port 22 is SSH");
        assert!(check_well_known_port(111).unwrap().contains("privileged"));
        assert!(check_well_known_port(8080).is_none());
    }

    #[test]
    fn test_check_reserved_ip() {
        let private: IpNetwork = "10.0.0.0/8".parse().unwrap();
        let public: IpNetwork = "8.8.8.0/24".parse().unwrap();
        let link_local: IpNetwork = "fe80::/10".parse().unwrap();
        assert!(check_reserved_ip(&private).unwrap().contains("private"));
        assert!(check_reserved_ip(&public).is_none());
        assert!(check_reserved_ip(&link_local).unwrap().contains("link-local"));
    }
}
