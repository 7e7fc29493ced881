// ── Source resolution ────────────────────────────────────────────────────────

use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::types::{TransferItem, TransferItemKind, TransferPlan};
use glob::MatchOptions;
use log::{debug, warn};
use std::path::{Component, Path, PathBuf};

/// Turn a source spec into a transfer plan.
///
/// An existing directory or file always wins over wildcard expansion, so a
/// file literally named `report?.txt` is transferred as-is. A wildcard that
/// matches nothing yields an empty plan rather than an error.
pub fn resolve(source_spec: &str) -> DeliveryResult<TransferPlan> {
    if source_spec.trim().is_empty() {
        return Err(DeliveryError::invalid_input("Source must not be empty"));
    }

    let path = Path::new(source_spec);
    if let Ok(metadata) = std::fs::metadata(path) {
        let kind = if metadata.is_dir() {
            TransferItemKind::Directory
        } else {
            TransferItemKind::File
        };
        let item = TransferItem::new(kind, absolutize(path)?);
        debug!("Resolved '{}' to {:?} '{}'", source_spec, kind, item.local_path.display());
        return Ok(TransferPlan {
            items: vec![item],
            from_wildcard: false,
        });
    }

    if is_wildcard(source_spec) {
        return expand(source_spec);
    }

    Err(DeliveryError::SourceNotFound(source_spec.to_string()))
}

pub fn is_wildcard(source: &str) -> bool {
    source.contains('*') || source.contains('?')
}

fn expand(pattern: &str) -> DeliveryResult<TransferPlan> {
    // Same visibility rules as a shell glob: `*` does not pick up dotfiles.
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };

    let matches = glob::glob_with(pattern, options).map_err(|e| {
        DeliveryError::invalid_input(format!("Invalid wildcard pattern '{}': {}", pattern, e))
    })?;

    let mut items = Vec::new();
    for entry in matches {
        let path = match entry {
            Ok(p) => p,
            Err(e) => {
                warn!("Skipping unreadable match for '{}': {}", pattern, e);
                continue;
            }
        };
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!("Skipping '{}': {}", path.display(), e);
                continue;
            }
        };
        let kind = if metadata.is_dir() {
            TransferItemKind::Directory
        } else {
            TransferItemKind::File
        };
        items.push(TransferItem::new(kind, absolutize(&path)?));
    }

    debug!("Wildcard '{}' matched {} entries", pattern, items.len());
    Ok(TransferPlan {
        items,
        from_wildcard: true,
    })
}

/// Make `path` absolute against the working directory and fold `.`/`..`
/// lexically. Symlinks are left alone.
fn absolutize(path: &Path) -> DeliveryResult<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| DeliveryError::unexpected(format!("Cannot read working directory: {}", e)))?
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn source_of(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_existing_file_is_single_file_item() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"alpha").unwrap();

        let plan = resolve(&source_of(&file)).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(!plan.from_wildcard);
        assert_eq!(plan.items[0].kind, TransferItemKind::File);
        assert_eq!(plan.items[0].local_path, file);
        assert_eq!(plan.items[0].basename, "a.txt");
    }

    #[test]
    fn test_existing_directory_is_single_directory_item() {
        let dir = tempfile::tempdir().unwrap();
        let proj = dir.path().join("proj");
        fs::create_dir(&proj).unwrap();
        fs::write(proj.join("a.txt"), b"a").unwrap();

        let plan = resolve(&source_of(&proj)).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.items[0].kind, TransferItemKind::Directory);
        assert_eq!(plan.items[0].local_path, proj);
        assert_eq!(plan.items[0].basename, "proj");
    }

    #[test]
    fn test_directory_with_trailing_separator_keeps_basename() {
        let dir = tempfile::tempdir().unwrap();
        let proj = dir.path().join("proj");
        fs::create_dir(&proj).unwrap();

        let plan = resolve(&format!("{}/", source_of(&proj))).unwrap();
        assert_eq!(plan.items[0].basename, "proj");
    }

    #[test]
    fn test_parent_components_are_folded() {
        let dir = tempfile::tempdir().unwrap();
        let proj = dir.path().join("proj");
        fs::create_dir(&proj).unwrap();
        fs::write(dir.path().join("notes.md"), b"n").unwrap();

        let plan = resolve(&format!("{}/../notes.md", source_of(&proj))).unwrap();
        assert_eq!(plan.items[0].local_path, dir.path().join("notes.md"));
    }

    #[test]
    fn test_wildcard_with_no_matches_is_empty_plan() {
        let dir = tempfile::tempdir().unwrap();
        let plan = resolve(&format!("{}/*.log", source_of(dir.path()))).unwrap();
        assert!(plan.is_empty());
        assert!(plan.from_wildcard);
    }

    #[test]
    fn test_wildcard_tags_each_match_by_type() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.log"), b"a").unwrap();
        fs::write(dir.path().join("b.log"), b"b").unwrap();
        fs::create_dir(dir.path().join("c.log")).unwrap();
        fs::write(dir.path().join("readme.txt"), b"r").unwrap();

        let plan = resolve(&format!("{}/*.log", source_of(dir.path()))).unwrap();
        assert_eq!(plan.len(), 3);
        let mut names: Vec<(&str, TransferItemKind)> = plan
            .iter()
            .map(|i| (i.basename.as_str(), i.kind))
            .collect();
        names.sort_by_key(|(n, _)| *n);
        assert_eq!(
            names,
            vec![
                ("a.log", TransferItemKind::File),
                ("b.log", TransferItemKind::File),
                ("c.log", TransferItemKind::Directory),
            ]
        );
    }

    #[test]
    fn test_question_mark_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("r1.csv"), b"1").unwrap();
        fs::write(dir.path().join("r22.csv"), b"22").unwrap();

        let plan = resolve(&format!("{}/r?.csv", source_of(dir.path()))).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.items[0].basename, "r1.csv");
    }

    #[test]
    fn test_wildcard_skips_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden.log"), b"h").unwrap();
        fs::write(dir.path().join("seen.log"), b"s").unwrap();

        let plan = resolve(&format!("{}/*.log", source_of(dir.path()))).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.items[0].basename, "seen.log");
    }

    #[test]
    fn test_missing_path_without_wildcard_is_source_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = source_of(&dir.path().join("nope.txt"));
        match resolve(&missing) {
            Err(DeliveryError::SourceNotFound(s)) => assert_eq!(s, missing),
            other => panic!("expected SourceNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_pattern_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let result = resolve(&format!("{}/[*.log", source_of(dir.path())));
        assert!(matches!(result, Err(DeliveryError::InvalidInput(_))));
    }

    #[test]
    fn test_empty_spec_is_invalid_input() {
        assert!(matches!(resolve("  "), Err(DeliveryError::InvalidInput(_))));
    }

    #[test]
    fn test_literal_file_with_wildcard_character_wins() {
        let dir = tempfile::tempdir().unwrap();
        let odd = dir.path().join("report?.txt");
        fs::write(&odd, b"q").unwrap();
        fs::write(dir.path().join("report1.txt"), b"1").unwrap();

        let plan = resolve(&source_of(&odd)).unwrap();
        assert!(!plan.from_wildcard);
        assert_eq!(plan.items[0].basename, "report?.txt");
    }
}
