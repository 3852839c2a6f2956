//! Share-relative path handling.
//!
//! Clients send names with `\` separators and a leading separator relative to
//! the share root. Internally every path is a relative `PathBuf` with `/`
//! separators, no `.` components and no `..` components; the share root is
//! the empty path.

use std::path::{Component, Path, PathBuf};

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Normalize a client-supplied name into a share-relative path.
///
/// Returns `None` when the name tries to climb out of the share with `..`.
/// `\Docs\\a.txt`, `/Docs/./a.txt` and `Docs/a.txt` all become `Docs/a.txt`.
pub fn to_share_path(name: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for part in name.split(is_separator) {
        match part {
            "" | "." => continue,
            ".." => return None,
            _ => out.push(part),
        }
    }
    Some(out)
}

/// Split a client-supplied name into (parent directory, leaf name).
///
/// Returns `None` if no leaf can be extracted: an empty name, a name ending in
/// a separator, or a leaf of `.`/`..`.
pub fn split_parent_leaf(name: &str) -> Option<(PathBuf, String)> {
    if name.is_empty() || name.ends_with(is_separator) {
        return None;
    }
    let (parent, leaf) = match name.rfind(is_separator) {
        Some(idx) => (&name[..idx], &name[idx + 1..]),
        None => ("", name),
    };
    if leaf == "." || leaf == ".." {
        return None;
    }
    Some((to_share_path(parent)?, leaf.to_string()))
}

/// Split an already-normalized share path into (parent, leaf).
pub fn split_share_path(path: &Path) -> Option<(PathBuf, String)> {
    let leaf = path.file_name()?.to_str()?.to_string();
    let parent = path.parent().unwrap_or(Path::new("")).to_path_buf();
    Some((parent, leaf))
}

/// True if `ancestor` is a strict ancestor of `path`. The root is an ancestor
/// of everything but itself.
pub fn is_ancestor(ancestor: &Path, path: &Path) -> bool {
    ancestor != path && path.starts_with(ancestor)
}

/// The child of `ancestor` that lies on the way down to `descendant`.
///
/// `child_toward("a", "a/b/c")` is `a/b`.
pub fn child_toward(ancestor: &Path, descendant: &Path) -> Option<PathBuf> {
    let rest = descendant.strip_prefix(ancestor).ok()?;
    match rest.components().next()? {
        Component::Normal(first) => Some(ancestor.join(first)),
        _ => None,
    }
}

/// Render a share path for log messages (`/` for the root).
pub fn display(path: &Path) -> String {
    format!("/{}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_share_path() {
        assert_eq!(
            to_share_path("\\Docs\\\\a.txt"),
            Some(PathBuf::from("Docs/a.txt"))
        );
        assert_eq!(
            to_share_path("/Docs/./a.txt"),
            Some(PathBuf::from("Docs/a.txt"))
        );
        assert_eq!(to_share_path("/"), Some(PathBuf::new()));
        assert_eq!(to_share_path("a/../../etc/passwd"), None);
    }

    #[test]
    fn test_split_parent_leaf() {
        assert_eq!(
            split_parent_leaf("/share/a.txt"),
            Some((PathBuf::from("share"), "a.txt".to_string()))
        );
        assert_eq!(
            split_parent_leaf("a.txt"),
            Some((PathBuf::new(), "a.txt".to_string()))
        );
        assert_eq!(
            split_parent_leaf("dir\\sub\\leaf"),
            Some((PathBuf::from("dir/sub"), "leaf".to_string()))
        );
    }

    #[test]
    fn test_split_rejects_empty_leaf() {
        assert_eq!(split_parent_leaf("dir/"), None);
        assert_eq!(split_parent_leaf("dir\\"), None);
        assert_eq!(split_parent_leaf(""), None);
        assert_eq!(split_parent_leaf("dir/.."), None);
        assert_eq!(split_parent_leaf("../x"), None);
    }

    #[test]
    fn test_split_share_path() {
        assert_eq!(
            split_share_path(Path::new("a/b")),
            Some((PathBuf::from("a"), "b".to_string()))
        );
        assert_eq!(
            split_share_path(Path::new("top")),
            Some((PathBuf::new(), "top".to_string()))
        );
        assert_eq!(split_share_path(Path::new("")), None);
    }

    #[test]
    fn test_is_ancestor() {
        assert!(is_ancestor(Path::new(""), Path::new("a")));
        assert!(is_ancestor(Path::new("a"), Path::new("a/b/c")));
        assert!(!is_ancestor(Path::new("a"), Path::new("a")));
        assert!(!is_ancestor(Path::new("a"), Path::new("ab/c")));
        assert!(!is_ancestor(Path::new("a/b"), Path::new("a")));
    }

    #[test]
    fn test_child_toward() {
        assert_eq!(
            child_toward(Path::new("a"), Path::new("a/b/c")),
            Some(PathBuf::from("a/b"))
        );
        assert_eq!(
            child_toward(Path::new(""), Path::new("x/y")),
            Some(PathBuf::from("x"))
        );
        assert_eq!(child_toward(Path::new("a"), Path::new("a")), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(display(Path::new("")), "/");
        assert_eq!(display(Path::new("a/b")), "/a/b");
    }
}
