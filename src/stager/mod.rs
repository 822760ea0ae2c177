//! Staged filesystem construction.
//!
//! Each submodule owns one phase; `stage()` sequences them the way the
//! orchestrator expects: base home, workspace clone, CoW backend selection
//! (with Fuse-mount fallback to Overlay), workspace symlink, then declared
//! cache mounts.

pub mod backend;
pub mod base_home;
pub mod cache;
pub mod fuse_backend;
pub mod migrate;
pub mod overlay;
pub mod symlink;
pub mod workspace;

use crate::config::{Config, FsBackend, Paths};
use crate::error::InitError;
use crate::user::UserRecord;

/// Result of the CoW backend stage: which backend ended up live at
/// `MOUNT_HOME`, for the orchestrator's log line and `pid1` env.
pub struct StagedFilesystem {
    pub backend: FsBackend,
}

/// Run every filesystem-staging phase against a resolved `user`/`paths` pair. The
/// workspace clone must finish writing into `BASE_HOME/workspace` before the
/// CoW backend mounts it as part of its lower layer, so cloning and mounting
/// run strictly in sequence; everything else that follows is sequential too.
pub async fn stage(config: &Config, paths: &Paths, user: &UserRecord) -> Result<StagedFilesystem, InitError> {
    base_home::init(paths, user)?;

    workspace::clone(
        paths,
        user,
        config.workspace_source.as_deref(),
        config.workspace_commit.as_deref(),
    )
    .await?;

    let selected = backend::select(paths, &config.session_id, config.fs_backend_override);
    // Migration only applies when Fuse was picked because the legacy
    // database exists, not when the operator explicitly overrode the
    // backend to `fuse`.
    let legacy_fuse = selected == FsBackend::Fuse && config.fs_backend_override.is_none();

    let live_backend = match selected {
        FsBackend::Overlay => overlay::mount(paths, &config.session_id, user).map(|()| FsBackend::Overlay)?,
        FsBackend::Fuse if legacy_fuse => mount_and_migrate(paths, &config.session_id, user).await?,
        FsBackend::Fuse => match fuse_backend::mount(paths, &config.session_id, user, &paths.mount_home).await {
            Ok(()) => FsBackend::Fuse,
            Err(e) => {
                tracing::warn!(error = %e, "fuse mount failed, falling back to overlay backend");
                overlay::mount(paths, &config.session_id, user).map(|()| FsBackend::Overlay)?
            }
        },
    };

    workspace::register_safe_dirs(paths, None).await;

    symlink::relink(paths)?;

    cache::mount_declared(paths, config.cache_disabled)?;

    Ok(StagedFilesystem { backend: live_backend })
}

/// Mount the legacy Fuse store at a scratch path under `FUSE_ROOT` and
/// migrate its content into a fresh Overlay session at `MOUNT_HOME`. Falls
/// back to a bare Overlay mount if the Fuse store itself fails to mount
/// (there is nothing to migrate yet in that case).
async fn mount_and_migrate(paths: &Paths, session_id: &str, user: &UserRecord) -> Result<FsBackend, InitError> {
    let scratch = paths.fuse_root.join(format!("{session_id}.mnt"));
    if let Err(e) = fuse_backend::mount(paths, session_id, user, &scratch).await {
        tracing::warn!(error = %e, "legacy fuse mount failed, mounting overlay directly");
        overlay::mount(paths, session_id, user)?;
        return Ok(FsBackend::Overlay);
    }

    migrate::migrate(paths, session_id, user, &scratch).await?;
    let _ = std::fs::remove_dir(&scratch);
    Ok(FsBackend::Overlay)
}
