//! Key derivation for repository storage prefixes

/// Storage prefix for one repository: `repos/{owner_id}/{repo_name}.git`.
///
/// Pure derivation, no I/O. A trailing `.git` on `repo_name` is not doubled.
pub fn repo_prefix(owner_id: &str, repo_name: &str) -> String {
    let name = repo_name.strip_suffix(".git").unwrap_or(repo_name);
    format!("repos/{}/{}.git", normalize(owner_id), normalize(name))
}

/// Collapse repeated slashes and strip leading/trailing slashes.
pub fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Map a repository-relative path to its object-store key.
///
/// Paths already absolute under `prefix` are kept as they are. The empty
/// path maps to the prefix itself.
pub fn resolve_key(prefix: &str, path: &str) -> String {
    let prefix = normalize(prefix);
    let path = normalize(path);

    if path.is_empty() {
        return prefix;
    }
    if prefix.is_empty() || path == prefix || path.starts_with(&format!("{}/", prefix)) {
        return path;
    }
    format!("{}/{}", prefix, path)
}

/// Key prefix matching everything strictly below `key` (`key` + `/`).
pub(crate) fn dir_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{}/", key)
    }
}

/// First path segment of `key` after `dir_prefix`, if `key` lies below it.
pub(crate) fn child_name<'a>(dir_prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(dir_prefix)?;
    let name = rest.split('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("//objects///ab/"), "objects/ab");
        assert_eq!(normalize("/"), "");
        assert_eq!(normalize("HEAD"), "HEAD");
    }

    #[test]
    fn test_resolve_key() {
        let prefix = "repos/u1/demo.git";
        assert_eq!(resolve_key(prefix, "HEAD"), "repos/u1/demo.git/HEAD");
        assert_eq!(resolve_key(prefix, "/refs//heads/main/"), "repos/u1/demo.git/refs/heads/main");
        assert_eq!(resolve_key(prefix, "repos/u1/demo.git/config"), "repos/u1/demo.git/config");
        assert_eq!(resolve_key(prefix, ""), "repos/u1/demo.git");
    }

    #[test]
    fn test_resolve_key_does_not_match_sibling_prefix() {
        let prefix = "repos/u1/demo.git";
        assert_eq!(
            resolve_key(prefix, "repos/u1/demo.git2/HEAD"),
            "repos/u1/demo.git/repos/u1/demo.git2/HEAD"
        );
    }

    #[test]
    fn test_repo_prefix() {
        assert_eq!(repo_prefix("42", "demo"), "repos/42/demo.git");
        assert_eq!(repo_prefix("42", "demo.git"), "repos/42/demo.git");
    }

    #[test]
    fn test_child_name() {
        assert_eq!(child_name("p/objects/", "p/objects/ab/cdef"), Some("ab"));
        assert_eq!(child_name("p/objects/", "p/objects/pack"), Some("pack"));
        assert_eq!(child_name("p/objects/", "p/refs/heads/main"), None);
    }
}
