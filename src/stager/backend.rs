//! CoW backend selection.

use crate::config::{FsBackend, Paths};

/// Decision order: explicit override > `.migrated` marker > legacy FUSE
/// database > default (Overlay, for brand-new sessions).
pub fn select(paths: &Paths, session_id: &str, r#override: Option<FsBackend>) -> FsBackend {
    if let Some(backend) = r#override {
        return backend;
    }
    if paths.migrated_marker(session_id).exists() {
        return FsBackend::Overlay;
    }
    if paths.session_fuse_db(session_id).exists() {
        return FsBackend::Fuse;
    }
    FsBackend::Overlay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn test_paths(data_dir: &std::path::Path) -> Paths {
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
        cfg.paths(&data_dir.join("image/sandbox"))
    }

    #[test]
    fn defaults_to_overlay_for_new_session() {
        let dir = tempdir().unwrap();
        let paths = test_paths(dir.path());
        assert_eq!(select(&paths, "s1", None), FsBackend::Overlay);
    }

    #[test]
    fn override_wins_over_everything() {
        let dir = tempdir().unwrap();
        let paths = test_paths(dir.path());
        std::fs::create_dir_all(paths.session_overlay_dir("s1")).unwrap();
        std::fs::write(paths.migrated_marker("s1"), "2024-01-01T00:00:00Z").unwrap();
        assert_eq!(select(&paths, "s1", Some(FsBackend::Fuse)), FsBackend::Fuse);
    }

    #[test]
    fn migrated_marker_wins_over_fuse_db() {
        let dir = tempdir().unwrap();
        let paths = test_paths(dir.path());
        std::fs::create_dir_all(&paths.fuse_root).unwrap();
        std::fs::write(paths.session_fuse_db("s1"), b"").unwrap();
        std::fs::create_dir_all(paths.session_overlay_dir("s1")).unwrap();
        std::fs::write(paths.migrated_marker("s1"), "2024-01-01T00:00:00Z").unwrap();
        assert_eq!(select(&paths, "s1", None), FsBackend::Overlay);
    }

    #[test]
    fn fuse_db_selects_fuse_without_marker() {
        let dir = tempdir().unwrap();
        let paths = test_paths(dir.path());
        std::fs::create_dir_all(&paths.fuse_root).unwrap();
        std::fs::write(paths.session_fuse_db("s1"), b"").unwrap();
        assert_eq!(select(&paths, "s1", None), FsBackend::Fuse);
    }
}
