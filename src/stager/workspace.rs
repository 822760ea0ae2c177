//! Idempotent workspace clone via staging-and-rename, and the
//! related `git config --system safe.directory` bookkeeping.

use std::path::Path;

use tokio::process::Command;

use crate::config::Paths;
use crate::error::InitError;
use crate::user::UserRecord;

pub async fn clone(
    paths: &Paths,
    user: &UserRecord,
    source: Option<&str>,
    commit: Option<&str>,
) -> Result<(), InitError> {
    if paths.workspace.exists() {
        tracing::debug!("workspace already present, skipping clone");
        return Ok(());
    }

    let Some(source) = source else {
        std::fs::create_dir_all(&paths.workspace)
            .map_err(|e| InitError::stage(&paths.workspace, e))?;
        crate::platform::chown_path(&paths.workspace, user.uid, user.gid)
            .map_err(|e| InitError::stage(&paths.workspace, e))?;
        return Ok(());
    };

    if paths.staging.exists() {
        std::fs::remove_dir_all(&paths.staging).map_err(|e| InitError::stage(&paths.staging, e))?;
    }

    run_git(&["clone", "--single-branch", source, &path_str(&paths.staging)]).await?;

    if let Some(commit) = commit {
        let branch = format!("{}-session", crate::config::PRODUCT);
        run_git_in(&paths.staging, &["checkout", "-B", &branch, commit]).await?;
    }

    chown_recursive(&paths.staging, user)?;

    std::fs::rename(&paths.staging, &paths.workspace)
        .map_err(|e| InitError::stage(&paths.workspace, e))?;

    Ok(())
}

/// Register safe-directory entries with the system-wide git config.
/// Failures here are warnings, never fatal.
pub async fn register_safe_dirs(paths: &Paths, workspace_mount: Option<&Path>) {
    let mut dirs: Vec<std::path::PathBuf> = Vec::new();
    if let Some(mount) = workspace_mount {
        dirs.push(mount.to_path_buf());
        dirs.push(mount.join(".git"));
    }
    dirs.push(paths.workspace.clone());
    dirs.push(paths.staging.clone());
    dirs.push(paths.mount_home.join("workspace"));
    dirs.push(paths.workspace_link.clone());

    for dir in dirs {
        let dir_str = path_str(&dir);
        let status = Command::new("git")
            .args(["config", "--system", "--add", "safe.directory", &dir_str])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::inherit())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => tracing::warn!(dir = %dir_str, code = ?s.code(), "git safe.directory registration failed"),
            Err(e) => tracing::warn!(dir = %dir_str, error = %e, "failed to invoke git for safe.directory"),
        }
    }
}

async fn run_git(args: &[&str]) -> Result<(), InitError> {
    run_cmd("git", args, None).await
}

async fn run_git_in(dir: &Path, args: &[&str]) -> Result<(), InitError> {
    run_cmd("git", args, Some(dir)).await
}

async fn run_cmd(program: &str, args: &[&str], dir: Option<&Path>) -> Result<(), InitError> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    let status = cmd
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .status()
        .await
        .map_err(|e| InitError::subprocess(program, e.to_string()))?;
    if !status.success() {
        return Err(InitError::subprocess(
            format!("{program} {}", args.join(" ")),
            format!("exited with {status}"),
        ));
    }
    Ok(())
}

fn chown_recursive(root: &Path, user: &UserRecord) -> Result<(), InitError> {
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| InitError::stage(root, std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        crate::platform::chown_path(entry.path(), user.uid, user.gid)
            .map_err(|e| InitError::stage(entry.path(), e))?;
    }
    Ok(())
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().to_string()
}
