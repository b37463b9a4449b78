//! Owner-only filesystem access for vault files.

use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Restricts filesystem access to the owning identity.
pub trait PermissionGuard: Send + Sync {
    /// Apply owner-only permissions: 0600 for files, 0700 for directories.
    fn restrict_to_owner(&self, path: &Path) -> std::io::Result<()>;
}

/// Default guard. Uses Unix mode bits; elsewhere it only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerOnly;

impl PermissionGuard for OwnerOnly {
    #[cfg(unix)]
    fn restrict_to_owner(&self, path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let mode = if path.is_dir() { 0o700 } else { 0o600 };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    fn restrict_to_owner(&self, path: &Path) -> std::io::Result<()> {
        tracing::debug!(
            path = %path.display(),
            "Owner-only permissions are not enforced on this platform"
        );
        Ok(())
    }
}

/// Create `path` (which must not exist), restrict it through `guard`, then
/// write `data` and fsync. A partially written file is removed.
pub(crate) async fn write_private_file(
    guard: &dyn PermissionGuard,
    path: &Path,
    data: &[u8],
) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    let written = async {
        guard.restrict_to_owner(path)?;
        file.write_all(data).await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = written {
        drop(file);
        let _ = tokio::fs::remove_file(path).await;
        return Err(e);
    }
    Ok(())
}

/// Atomically replace `path` with an owner-only file holding `data`.
pub(crate) async fn replace_private_file(
    guard: &dyn PermissionGuard,
    path: &Path,
    data: &[u8],
) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));
    write_private_file(guard, &tmp_path, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

/// Create a directory tree and restrict the leaf to its owner.
pub(crate) fn ensure_private_dir(guard: &dyn PermissionGuard, dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    guard.restrict_to_owner(dir)
}

/// Human-readable problems for paths readable or writable beyond their owner.
pub fn permission_problems<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Vec<String> {
    let mut problems = Vec::new();
    for path in paths {
        let Ok(meta) = std::fs::metadata(path) else {
            continue;
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                problems.push(format!(
                    "{} has mode {:o}; expected owner-only access",
                    path.display(),
                    mode
                ));
            }
        }
        #[cfg(not(unix))]
        let _ = meta;
    }
    problems
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Records every path it is asked to restrict, then delegates to `OwnerOnly`.
    #[derive(Default)]
    pub(crate) struct RecordingGuard {
        pub seen: Mutex<Vec<PathBuf>>,
    }

    impl RecordingGuard {
        pub(crate) fn files(&self) -> Vec<PathBuf> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|p| !p.is_dir())
                .cloned()
                .collect()
        }
    }

    impl PermissionGuard for RecordingGuard {
        fn restrict_to_owner(&self, path: &Path) -> std::io::Result<()> {
            self.seen.lock().unwrap().push(path.to_path_buf());
            OwnerOnly.restrict_to_owner(path)
        }
    }

    struct RefusingGuard;

    impl PermissionGuard for RefusingGuard {
        fn restrict_to_owner(&self, _path: &Path) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "cannot restrict",
            ))
        }
    }

    #[cfg(unix)]
    fn mode_of(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[tokio::test]
    async fn private_file_goes_through_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let guard = RecordingGuard::default();
        write_private_file(&guard, &path, b"{}").await.unwrap();
        assert_eq!(guard.files(), vec![path.clone()]);
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
        #[cfg(unix)]
        assert_eq!(mode_of(&path), 0o600);

        // create_new refuses to clobber
        assert!(write_private_file(&guard, &path, b"x").await.is_err());
    }

    #[tokio::test]
    async fn refused_restriction_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        assert!(write_private_file(&RefusingGuard, &path, b"data").await.is_err());
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn restrict_to_owner_sets_file_and_dir_modes() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("vault");
        std::fs::create_dir(&sub).unwrap();
        std::fs::set_permissions(&sub, std::fs::Permissions::from_mode(0o755)).unwrap();
        let file = sub.join("f");
        std::fs::write(&file, b"x").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).unwrap();

        assert_eq!(permission_problems([sub.as_path(), file.as_path()]).len(), 2);

        OwnerOnly.restrict_to_owner(&sub).unwrap();
        OwnerOnly.restrict_to_owner(&file).unwrap();
        assert_eq!(mode_of(&sub), 0o700);
        assert_eq!(mode_of(&file), 0o600);
        assert!(permission_problems([sub.as_path(), file.as_path()]).is_empty());
    }

    #[tokio::test]
    async fn replace_private_file_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        std::fs::write(&path, b"old").unwrap();

        let guard = RecordingGuard::default();
        replace_private_file(&guard, &path, b"new").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        #[cfg(unix)]
        assert_eq!(mode_of(&path), 0o600);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(guard.files().len(), 1);
    }

    #[test]
    fn missing_paths_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(permission_problems([missing.as_path()]).is_empty());
    }
}
