//! Point `WORKSPACE_LINK` (`/workspace`) at the mounted home's
//! workspace directory, replacing any stale link left by a previous boot.

use std::os::unix::fs::symlink;

use crate::config::Paths;
use crate::error::InitError;

pub fn relink(paths: &Paths) -> Result<(), InitError> {
    let target = paths.mount_home.join("workspace");

    match std::fs::symlink_metadata(&paths.workspace_link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            std::fs::remove_file(&paths.workspace_link)
                .map_err(|e| InitError::stage(&paths.workspace_link, e))?;
        }
        Ok(meta) if meta.file_type().is_dir() => {
            std::fs::remove_dir_all(&paths.workspace_link)
                .map_err(|e| InitError::stage(&paths.workspace_link, e))?;
        }
        Ok(_) => {
            std::fs::remove_file(&paths.workspace_link)
                .map_err(|e| InitError::stage(&paths.workspace_link, e))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(InitError::stage(&paths.workspace_link, e)),
    }

    symlink(&target, &paths.workspace_link).map_err(|e| InitError::stage(&paths.workspace_link, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn test_paths(data_dir: &std::path::Path, link: &std::path::Path) -> Paths {
        let cfg = Config {
            session_id: "s1".into(),
            workspace_source: None,
            workspace_commit: None,
            agent_bin: PathBuf::from("/bin/true"),
            run_as_user: "sandbox".into(),
            fs_backend_override: None,
            cache_disabled: false,
            data_dir: data_dir.to_path_buf(),
            log_json: false,
        };
        let mut paths = cfg.paths(&data_dir.join("image/sandbox"));
        paths.workspace_link = link.to_path_buf();
        paths
    }

    #[test]
    fn relink_replaces_stale_symlink() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("workspace-link");
        symlink("/nowhere", &link).unwrap();
        let paths = test_paths(dir.path(), &link);

        relink(&paths).unwrap();

        let resolved = std::fs::read_link(&link).unwrap();
        assert_eq!(resolved, paths.mount_home.join("workspace"));
    }

    #[test]
    fn relink_creates_when_absent() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("workspace-link");
        let paths = test_paths(dir.path(), &link);

        relink(&paths).unwrap();
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
    }

    #[test]
    fn relink_replaces_regular_file() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("workspace-link");
        std::fs::write(&link, b"leftover").unwrap();
        let paths = test_paths(dir.path(), &link);

        relink(&paths).unwrap();

        let meta = link.symlink_metadata().unwrap();
        assert!(meta.file_type().is_symlink());
    }

    #[test]
    fn relink_replaces_directory() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("workspace-link");
        std::fs::create_dir_all(link.join("nested")).unwrap();
        let paths = test_paths(dir.path(), &link);

        relink(&paths).unwrap();

        let meta = link.symlink_metadata().unwrap();
        assert!(meta.file_type().is_symlink());
    }
}
