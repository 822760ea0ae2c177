//! Kernel overlay mount.

use nix::mount::MsFlags;

use crate::config::Paths;
use crate::error::InitError;
use crate::platform;
use crate::user::UserRecord;

pub fn session_dirs(paths: &Paths, session_id: &str) -> (std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
    let session_dir = paths.session_overlay_dir(session_id);
    (session_dir.join("upper"), session_dir.join("work"), session_dir)
}

pub fn mount(paths: &Paths, session_id: &str, user: &UserRecord) -> Result<(), InitError> {
    let (upper, work, session_dir) = session_dirs(paths, session_id);

    platform::ensure_dir_owned(&paths.overlay_root, nix::unistd::Uid::from_raw(0), nix::unistd::Gid::from_raw(0))
        .map_err(|e| InitError::stage(&paths.overlay_root, e))?;
    platform::ensure_dir_owned(&session_dir, user.uid, user.gid).map_err(|e| InitError::stage(&session_dir, e))?;
    platform::ensure_dir_owned(&upper, user.uid, user.gid).map_err(|e| InitError::stage(&upper, e))?;
    platform::ensure_dir_owned(&work, user.uid, user.gid).map_err(|e| InitError::stage(&work, e))?;
    std::fs::create_dir_all(&paths.mount_home).map_err(|e| InitError::stage(&paths.mount_home, e))?;

    let data = format!(
        "lowerdir={},upperdir={},workdir={}",
        paths.base_home.display(),
        upper.display(),
        work.display(),
    );
    let mount_home = paths.mount_home.to_string_lossy().to_string();

    if let Err(e) = platform::mount(Some("overlay"), &mount_home, Some("overlay"), MsFlags::empty(), Some(&data)) {
        tracing::warn!(error = %e, "overlay mount failed, cleaning up session dir");
        let _ = std::fs::remove_dir_all(&session_dir);
        return Err(e);
    }

    Ok(())
}

/// Remove a session's overlay state directory (used on fallback to Fuse).
pub fn cleanup_session_dir(paths: &Paths, session_id: &str) {
    let session_dir = paths.session_overlay_dir(session_id);
    if let Err(e) = std::fs::remove_dir_all(&session_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %session_dir.display(), error = %e, "failed to clean up overlay session dir");
        }
    }
}
