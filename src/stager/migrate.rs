//! One-shot migration from the Fuse backend to the kernel overlay
//! backend. Resolved design note: the unmount guard disarms on an explicit
//! flag set after the last fallible step, not on panic detection.

use std::path::Path;

use nix::mount::MntFlags;
use tokio::process::Command;

use crate::config::Paths;
use crate::error::InitError;
use crate::platform;
use crate::stager::overlay;
use crate::user::UserRecord;

/// RAII guard that unmounts `target` on drop unless `disarm()` was called.
/// Keeps the old Fuse mount unwound if a later fallible step panics or
/// returns early, without depending on a scope-exit-only disarm point.
struct UnmountGuard<'a> {
    target: &'a str,
    armed: bool,
}

impl<'a> UnmountGuard<'a> {
    fn new(target: &'a str) -> Self {
        Self { target, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for UnmountGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(target = self.target, "migration aborted, unwinding overlay mount");
            platform::umount_best_effort(self.target);
        }
    }
}

/// Migrate `session_id` off the Fuse backend currently mounted at
/// `fuse_mount`: mount a fresh overlay session, rsync the Fuse content into
/// it, drop the `.migrated` marker, then unmount the old Fuse mount.
///
/// The overlay mount is guarded: any failure before the marker is written
/// unwinds it, leaving the Fuse mount as the backend of record.
pub async fn migrate(
    paths: &Paths,
    session_id: &str,
    user: &UserRecord,
    fuse_mount: &Path,
) -> Result<(), InitError> {
    tracing::info!(session_id, "migrating session from fuse to overlay backend");

    overlay::mount(paths, session_id, user)?;
    let mount_home_str = paths.mount_home.to_string_lossy().to_string();
    let mut guard = UnmountGuard::new(&mount_home_str);

    let result = run_rsync(fuse_mount, &paths.mount_home).await;
    if let Err(e) = result {
        overlay::cleanup_session_dir(paths, session_id);
        return Err(e);
    }

    std::fs::write(paths.migrated_marker(session_id), chrono::Utc::now().to_rfc3339())
        .map_err(|e| InitError::stage(paths.migrated_marker(session_id), e))?;

    guard.disarm();

    let fuse_mount_str = fuse_mount.to_string_lossy();
    if let Err(e) = platform::umount(&fuse_mount_str, MntFlags::empty()) {
        tracing::warn!(mount = %fuse_mount_str, error = %e, "migration succeeded but fuse unmount failed, leaving stale mount");
    }

    tracing::info!(session_id, "migration to overlay backend complete");
    Ok(())
}

async fn run_rsync(source: &Path, dest: &Path) -> Result<(), InitError> {
    let status = Command::new("rsync")
        .args(["-a", "--delete"])
        .arg(format!("{}/", source.display()))
        .arg(format!("{}/", dest.display()))
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .status()
        .await
        .map_err(|e| InitError::subprocess("rsync", e.to_string()))?;

    if !status.success() {
        return Err(InitError::subprocess("rsync", format!("exited with {status}")));
    }
    Ok(())
}
