//! Per-user working directory derivation and validation.
//!
//! Every session cwd must stay under `base_dir/<user_id>`. Validation is
//! lexical: paths are normalized component by component without touching the
//! filesystem, and anything that would pop above the user root is rejected.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Maximum accepted `user_id` length.
pub const USER_ID_MAX_LEN: usize = 64;

/// Maximum accepted `subdir` length.
pub const SUBDIR_MAX_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("path escape: {0}")]
    PathEscape(String),

    #[error("workspace io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate a user identifier: 1..=64 chars of `[A-Za-z0-9_-]`.
pub fn validate_user_id(user_id: &str) -> Result<(), WorkspaceError> {
    if user_id.is_empty() {
        return Err(WorkspaceError::InvalidInput(
            "user_id cannot be empty".to_string(),
        ));
    }
    if user_id.len() > USER_ID_MAX_LEN {
        return Err(WorkspaceError::InvalidInput(format!(
            "user_id too long ({} > {USER_ID_MAX_LEN})",
            user_id.len()
        )));
    }
    if !user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(WorkspaceError::InvalidInput(
            "user_id must contain only alphanumeric characters, underscores, or hyphens"
                .to_string(),
        ));
    }
    Ok(())
}

/// Validate and sanitize a subdirectory path. Returns the trimmed form, or
/// `None` when the input is empty after trimming slashes.
pub fn validate_subdir(subdir: Option<&str>) -> Result<Option<String>, WorkspaceError> {
    let Some(raw) = subdir else {
        return Ok(None);
    };

    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(None);
    }
    if raw.starts_with('/') {
        return Err(WorkspaceError::InvalidInput(
            "absolute path not allowed in subdir".to_string(),
        ));
    }
    if trimmed.len() > SUBDIR_MAX_LEN {
        return Err(WorkspaceError::InvalidInput(format!(
            "subdir too long ({} > {SUBDIR_MAX_LEN})",
            trimmed.len()
        )));
    }
    if trimmed.contains('\0') {
        return Err(WorkspaceError::InvalidInput(
            "null bytes not allowed in path".to_string(),
        ));
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err(WorkspaceError::InvalidInput(
            "path traversal (..) not allowed in subdir".to_string(),
        ));
    }
    Ok(Some(trimmed.to_string()))
}

/// Build the working directory for a session: `base_dir/user_id[/subdir]`,
/// rejecting anything that normalizes outside `base_dir/user_id`.
pub fn build_cwd(
    base_dir: &Path,
    user_id: &str,
    subdir: Option<&str>,
) -> Result<PathBuf, WorkspaceError> {
    validate_user_id(user_id)?;
    let subdir = validate_subdir(subdir)?;

    let user_base = normalize(&base_dir.join(user_id));
    let cwd = match subdir {
        Some(ref sub) => normalize(&user_base.join(sub)),
        None => user_base.clone(),
    };

    if !cwd.starts_with(&user_base) {
        return Err(WorkspaceError::PathEscape(format!(
            "{} is not under {}",
            cwd.display(),
            user_base.display()
        )));
    }

    Ok(cwd)
}

/// Resolve additional agent directories relative to the session cwd. Each
/// entry must be relative and stay under the cwd after normalization.
pub fn build_add_dirs(cwd: &Path, dirs: &[String]) -> Result<Vec<PathBuf>, WorkspaceError> {
    let mut result = Vec::with_capacity(dirs.len());

    for dir in dirs {
        let trimmed = dir.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        if dir.starts_with('/') {
            return Err(WorkspaceError::InvalidInput(format!(
                "absolute path not allowed in add_dirs: {dir}"
            )));
        }
        if trimmed.split('/').any(|segment| segment == "..") {
            return Err(WorkspaceError::InvalidInput(format!(
                "path traversal (..) not allowed in add_dirs: {dir}"
            )));
        }

        let full = normalize(&cwd.join(trimmed));
        if !full.starts_with(cwd) {
            return Err(WorkspaceError::PathEscape(format!(
                "{dir} resolves outside the session directory"
            )));
        }
        result.push(full);
    }

    Ok(result)
}

/// Ensure the directory exists. With `auto_create` the directory and its
/// parents are created (mode 0o755 on Unix); existing directories are fine.
pub fn ensure_directory(path: &Path, auto_create: bool) -> Result<(), WorkspaceError> {
    if path.exists() {
        if path.is_dir() {
            return Ok(());
        }
        return Err(WorkspaceError::InvalidInput(format!(
            "path exists but is not a directory: {}",
            path.display()
        )));
    }

    if !auto_create {
        return Err(WorkspaceError::InvalidInput(format!(
            "directory does not exist: {}",
            path.display()
        )));
    }

    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Lexical normalization: resolve `.` and `..` without consulting the
/// filesystem. A `..` at the root is dropped, matching `os.path.normpath`.
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(
                    result.components().next_back(),
                    None | Some(Component::RootDir)
                ) {
                    result.pop();
                }
            }
            other => result.push(other),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_user_ids() {
        for id in ["alice", "bob-2", "user_01", "A1"] {
            validate_user_id(id).unwrap();
        }
    }

    #[test]
    fn test_invalid_user_ids() {
        for id in ["", "a b", "../x", "user/name", "héllo", &"x".repeat(65)] {
            assert!(validate_user_id(id).is_err(), "accepted {id:?}");
        }
    }

    #[test]
    fn test_subdir_trimmed() {
        assert_eq!(
            validate_subdir(Some("projects/demo/")).unwrap(),
            Some("projects/demo".to_string())
        );
        assert_eq!(validate_subdir(Some("")).unwrap(), None);
        assert_eq!(validate_subdir(None).unwrap(), None);
    }

    #[test]
    fn test_subdir_traversal_rejected() {
        assert!(validate_subdir(Some("../etc")).is_err());
        assert!(validate_subdir(Some("a/../../b")).is_err());
        assert!(validate_subdir(Some("/etc")).is_err());
        assert!(validate_subdir(Some("a\0b")).is_err());
    }

    #[test]
    fn test_build_cwd_plain() {
        let cwd = build_cwd(Path::new("/data/claude-users"), "alice", None).unwrap();
        assert_eq!(cwd, PathBuf::from("/data/claude-users/alice"));
    }

    #[test]
    fn test_build_cwd_with_subdir() {
        let cwd = build_cwd(
            Path::new("/data/claude-users"),
            "alice",
            Some("projects/demo"),
        )
        .unwrap();
        assert_eq!(cwd, PathBuf::from("/data/claude-users/alice/projects/demo"));
    }

    #[test]
    fn test_build_cwd_escape_rejected() {
        assert!(build_cwd(Path::new("/data/claude-users"), "bob", Some("../etc")).is_err());
        assert!(build_cwd(Path::new("/data/claude-users"), "bob", Some("/etc")).is_err());
    }

    #[test]
    fn test_build_cwd_prefix_always_user_base() {
        // Property 4: every accepted result stays under base_dir/user_id.
        let base = Path::new("/data/claude-users");
        for subdir in [None, Some("a"), Some("a/b/c"), Some("deep/./nested")] {
            if let Ok(cwd) = build_cwd(base, "carol", subdir) {
                assert!(cwd.starts_with("/data/claude-users/carol"), "{cwd:?}");
            }
        }
    }

    #[test]
    fn test_build_add_dirs() {
        let cwd = Path::new("/data/claude-users/alice");
        let dirs = build_add_dirs(cwd, &["shared".to_string(), "src/lib/".to_string()]).unwrap();
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/data/claude-users/alice/shared"),
                PathBuf::from("/data/claude-users/alice/src/lib"),
            ]
        );
    }

    #[test]
    fn test_build_add_dirs_escape_rejected() {
        let cwd = Path::new("/data/claude-users/alice");
        assert!(build_add_dirs(cwd, &["../bob".to_string()]).is_err());
        assert!(build_add_dirs(cwd, &["/etc".to_string()]).is_err());
    }

    #[test]
    fn test_ensure_directory_creates() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("a/b/c");
        ensure_directory(&target, true).unwrap();
        assert!(target.is_dir());
        // Existing directory is not an error.
        ensure_directory(&target, true).unwrap();
    }

    #[test]
    fn test_ensure_directory_missing_without_create() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("absent");
        assert!(ensure_directory(&target, false).is_err());
    }
}
