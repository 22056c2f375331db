// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod error;
pub mod fs;
pub mod types;

/// Version stamped into every persisted record.
pub const SCHEMA_VERSION: u32 = 1;

/// Identifiers (team, agent, task, thread) are restricted to this
/// character class so they are always safe as file names.
pub fn valid_ident(ident: &str) -> bool {
    !ident.is_empty()
        && ident
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Normalize a task resource to its stored form: forward slashes, no
/// leading `./` or `/`, no trailing `/`, no empty or `.` segments.
/// Returns `None` when the input is empty after normalization or
/// contains a `..` component.
pub fn normalize_resource(raw: &str) -> Option<String> {
    let unified = raw.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

/// True when `resource` covers `path`: equal, or a strict parent prefix.
/// Both sides must already be normalized.
pub fn resource_covers(resource: &str, path: &str) -> bool {
    if resource == path {
        return true;
    }
    path.strip_prefix(resource)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idents_reject_separators_and_empty() {
        assert!(valid_ident("worker_a"));
        assert!(valid_ident("task-0001"));
        assert!(valid_ident("v1.2_rc-3"));
        assert!(!valid_ident(""));
        assert!(!valid_ident("a/b"));
        assert!(!valid_ident("a b"));
        assert!(!valid_ident("Ω"));
    }

    #[test]
    fn resources_normalize_to_relative_slash_form() {
        assert_eq!(normalize_resource("./src/lib.rs"), Some("src/lib.rs".into()));
        assert_eq!(normalize_resource("src/"), Some("src".into()));
        assert_eq!(normalize_resource("/src"), Some("src".into()));
        assert_eq!(normalize_resource("a\\b"), Some("a/b".into()));
        assert_eq!(normalize_resource("a//b/./c"), Some("a/b/c".into()));
        assert_eq!(normalize_resource("../src"), None);
        assert_eq!(normalize_resource("a/../b"), None);
        assert_eq!(normalize_resource("."), None);
        assert_eq!(normalize_resource(""), None);
    }

    #[test]
    fn resource_prefix_matching_is_segment_wise() {
        assert!(resource_covers("src", "src"));
        assert!(resource_covers("src", "src/main.rs"));
        assert!(resource_covers("src/api", "src/api/v1/router.rs"));
        assert!(!resource_covers("src", "srcs/main.rs"));
        assert!(!resource_covers("src/main.rs", "src"));
    }
}
