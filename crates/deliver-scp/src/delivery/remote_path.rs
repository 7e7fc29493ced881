// ── Remote destination building ──────────────────────────────────────────────

use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::types::RemoteDestination;

/// Combine the fixed base directory with an optional subdirectory token.
///
/// Never fails: slashes around the token are trimmed so `/2023/` and `2023`
/// land in the same place, and a blank token selects the base itself.
pub fn build_destination(base_dir: &str, subdir_token: &str) -> RemoteDestination {
    let base = base_dir.trim();
    let mut path = if base.is_empty() {
        "/".to_string()
    } else {
        base.to_string()
    };
    if !path.ends_with('/') {
        path.push('/');
    }

    let token = subdir_token.trim().trim_matches('/');
    if !token.is_empty() {
        path.push_str(token);
        path.push('/');
    }

    RemoteDestination::from_normalized(path)
}

/// Reject subdirectory tokens that could leave the base directory.
pub fn validate_subdir_token(subdir_token: &str) -> DeliveryResult<()> {
    let token = subdir_token.trim();
    if token.chars().any(|c| c.is_control()) {
        return Err(DeliveryError::invalid_input(
            "Subdirectory contains control characters",
        ));
    }
    if token.split('/').any(|segment| segment == "..") {
        return Err(DeliveryError::invalid_input(format!(
            "Subdirectory '{}' must not contain '..' segments",
            token
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_token_is_base() {
        assert_eq!(build_destination("/data/", "").as_str(), "/data/");
        assert_eq!(build_destination("/data/", "   ").as_str(), "/data/");
    }

    #[test]
    fn test_base_gets_trailing_separator() {
        assert_eq!(build_destination("/data", "").as_str(), "/data/");
        assert_eq!(build_destination("/data", "2023").as_str(), "/data/2023/");
    }

    #[test]
    fn test_token_joined_with_single_separator() {
        assert_eq!(build_destination("/data/", "2023").as_str(), "/data/2023/");
    }

    #[test]
    fn test_token_separators_are_trimmed() {
        let plain = build_destination("/data/", "2023");
        assert_eq!(build_destination("/data/", "/2023/"), plain);
        assert_eq!(build_destination("/data/", "//2023").as_str(), "/data/2023/");
    }

    #[test]
    fn test_absolute_token_stays_under_base() {
        assert_eq!(build_destination("/data/", "/etc").as_str(), "/data/etc/");
    }

    #[test]
    fn test_slash_only_token_is_base() {
        assert_eq!(build_destination("/data/", "/").as_str(), "/data/");
    }

    #[test]
    fn test_nested_token_is_kept() {
        assert_eq!(
            build_destination("/srv/drop/", "2024/q1").as_str(),
            "/srv/drop/2024/q1/"
        );
    }

    #[test]
    fn test_empty_base_is_root() {
        assert_eq!(build_destination("", "2024").as_str(), "/2024/");
    }

    #[test]
    fn test_validate_accepts_years_and_nesting() {
        assert!(validate_subdir_token("2024").is_ok());
        assert!(validate_subdir_token("/2024/q1/").is_ok());
        assert!(validate_subdir_token("").is_ok());
        assert!(validate_subdir_token("v1..2").is_ok());
    }

    #[test]
    fn test_validate_rejects_parent_segments() {
        assert!(matches!(
            validate_subdir_token("../etc"),
            Err(DeliveryError::InvalidInput(_))
        ));
        assert!(validate_subdir_token("2024/../../root").is_err());
        assert!(validate_subdir_token("..").is_err());
    }

    #[test]
    fn test_validate_rejects_control_characters() {
        assert!(validate_subdir_token("2024\n; rm -rf /").is_err());
    }
}
