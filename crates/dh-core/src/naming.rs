//! Name and domain label rules

use crate::error::DevhostError;

/// Longest DNS label
pub const MAX_LABEL_LEN: usize = 63;

/// Longest instance or stack name
pub const MAX_NAME_LEN: usize = 64;

fn validate_label(label: &str) -> Result<(), DevhostError> {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return Err(DevhostError::validation(format!(
            "domain label must be 1-{} characters: {:?}",
            MAX_LABEL_LEN, label
        )));
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(DevhostError::validation(format!(
            "domain label may only contain a-z, 0-9 and '-': {:?}",
            label
        )));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(DevhostError::validation(format!(
            "domain label must not start or end with '-': {:?}",
            label
        )));
    }
    Ok(())
}

/// Normalize user input into a validated subdomain (without the tld)
///
/// Accepts `api`, `API.test`, `admin.api.test.` and the like.
pub fn normalize_subdomain(input: &str, tld: &str) -> Result<String, DevhostError> {
    let lowered = input.trim().trim_end_matches('.').to_ascii_lowercase();
    let suffix = format!(".{}", tld);
    let subdomain = lowered.strip_suffix(&suffix).unwrap_or(&lowered);

    if subdomain.is_empty() || subdomain == tld {
        return Err(DevhostError::validation("domain must have a subdomain"));
    }
    for label in subdomain.split('.') {
        validate_label(label)?;
    }
    Ok(subdomain.to_string())
}

/// Join a subdomain and the tld
pub fn full_domain(subdomain: &str, tld: &str) -> String {
    format!("{}.{}", subdomain, tld)
}

/// Whether a queried name falls under `tld` (the bare tld included)
pub fn is_under_tld(name: &str, tld: &str) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    let tld = tld.trim_matches('.');
    name == tld || name.ends_with(&format!(".{}", tld))
}

/// Turn a directory name into a label, or None if nothing usable remains
pub fn sanitize_label(name: &str) -> Option<String> {
    let mut label = String::with_capacity(name.len());
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            label.push(c);
        } else if !label.ends_with('-') {
            label.push('-');
        }
    }
    let label: String = label.trim_matches('-').chars().take(MAX_LABEL_LEN).collect();
    let label = label.trim_end_matches('-').to_string();
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

/// Validate an instance or stack name
pub fn validate_name(kind: &str, name: &str) -> Result<(), DevhostError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(DevhostError::validation(format!(
            "{} name must be 1-{} characters",
            kind, MAX_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DevhostError::validation(format!(
            "{} name may only contain letters, digits, '-' and '_': {:?}",
            kind, name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_tld() {
        assert_eq!(normalize_subdomain("API.test", "test").unwrap(), "api");
        assert_eq!(normalize_subdomain("admin.api.test.", "test").unwrap(), "admin.api");
        assert_eq!(normalize_subdomain("shop", "test").unwrap(), "shop");
    }

    #[test]
    fn test_normalize_rejects_bad_labels() {
        assert!(normalize_subdomain("", "test").is_err());
        assert!(normalize_subdomain("test", "test").is_err());
        assert!(normalize_subdomain("-api", "test").is_err());
        assert!(normalize_subdomain("a..b", "test").is_err());
        assert!(normalize_subdomain("my_app", "test").is_err());
        assert!(normalize_subdomain(&"a".repeat(64), "test").is_err());
        assert!(normalize_subdomain(&"a".repeat(63), "test").is_ok());
    }

    #[test]
    fn test_is_under_tld() {
        assert!(is_under_tld("api.test.", "test"));
        assert!(is_under_tld("TEST", "test"));
        assert!(is_under_tld("a.b.test", "test"));
        assert!(!is_under_tld("contest", "test"));
        assert!(!is_under_tld("example.com.", "test"));
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("My_Project").as_deref(), Some("my-project"));
        assert_eq!(sanitize_label("--blog  v2--").as_deref(), Some("blog-v2"));
        assert_eq!(sanitize_label("___"), None);
        assert_eq!(sanitize_label(&"x".repeat(80)).unwrap().len(), MAX_LABEL_LEN);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("instance", "redis_main-2").is_ok());
        assert!(validate_name("instance", "").is_err());
        assert!(validate_name("instance", "has space").is_err());
    }
}
