//! Cache bind-mounts: a built-in list of well-known package-manager and
//! toolchain cache directories under `MOUNT_HOME`, plus paths a workspace
//! declares itself via a JSON config. Each accepted path gets a matching
//! directory under the shared cache volume and a bind mount on top of it.

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::config::{Paths, PRODUCT};
use crate::error::InitError;

const CACHE_CONFIG_FILE: &str = "cache.json";
const SHARED_DIR_MODE: u32 = 0o777;

/// Relative to `MOUNT_HOME`. Covers the caches of the toolchains an agent
/// is most likely to invoke.
const BUILT_IN_CACHE_PATHS: &[&str] = &[
    ".cache/pip",
    ".cache/uv",
    ".npm",
    ".cache/yarn",
    ".cargo/registry",
    ".cache/go-build",
    ".m2/repository",
    ".gradle/caches",
    ".bundle/cache",
    ".nuget/packages",
];

#[derive(Debug, Deserialize, Default)]
struct CacheConfig {
    #[serde(default, rename = "additionalPaths")]
    additional_paths: Vec<String>,
}

/// Bind-mount the built-in cache directories plus whatever `additionalPaths`
/// the workspace declares in `MOUNT_HOME/workspace/.<product>/cache.json`.
/// A missing cache volume root or a disabled flag skips the whole phase
/// silently; a missing or malformed config file only drops the
/// workspace-declared list, the built-ins still mount.
pub fn mount_declared(paths: &Paths, cache_disabled: bool) -> Result<(), InitError> {
    if cache_disabled {
        tracing::debug!("cache bind-mounts disabled by configuration");
        return Ok(());
    }

    if !paths.cache_volume.exists() {
        tracing::debug!(path = %paths.cache_volume.display(), "cache volume root absent, skipping cache mounts");
        return Ok(());
    }

    let additional = read_additional_paths(paths);

    let mut targets: Vec<PathBuf> = BUILT_IN_CACHE_PATHS.iter().map(|p| paths.mount_home.join(p)).collect();
    for declared in &additional {
        match resolve_additional(&paths.mount_home, declared) {
            Ok(target) => targets.push(target),
            Err(reason) => tracing::warn!(declared, reason, "rejecting cache path"),
        }
    }

    for target in targets {
        if let Err(e) = mount_one(paths, &target) {
            tracing::warn!(target = %target.display(), error = %e, "cache bind mount failed, continuing");
        }
    }

    Ok(())
}

fn read_additional_paths(paths: &Paths) -> Vec<String> {
    let config_path = paths.mount_home.join("workspace").join(format!(".{PRODUCT}")).join(CACHE_CONFIG_FILE);
    let raw = match std::fs::read_to_string(&config_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %config_path.display(), error = %e, "failed to read cache.json, using built-in paths only");
            return Vec::new();
        }
    };

    match serde_json::from_str::<CacheConfig>(&raw) {
        Ok(c) => c.additional_paths,
        Err(e) => {
            tracing::warn!(path = %config_path.display(), error = %e, "malformed cache.json, using built-in paths only");
            Vec::new()
        }
    }
}

fn mount_one(paths: &Paths, target: &Path) -> Result<(), InitError> {
    let relative = target
        .strip_prefix(&paths.mount_home)
        .expect("target was resolved within mount_home");
    let source = paths.cache_volume.join(relative);

    ensure_mode_chain(&source, &paths.cache_volume, SHARED_DIR_MODE).map_err(|e| InitError::stage(&source, e))?;
    ensure_mode_chain(target, &paths.mount_home, SHARED_DIR_MODE).map_err(|e| InitError::stage(target, e))?;

    crate::platform::bind_mount(&source.to_string_lossy(), &target.to_string_lossy())
}

/// Create `leaf` (and any missing ancestors) and chmod every directory from
/// `leaf` up to and including `root` to `mode`.
fn ensure_mode_chain(leaf: &Path, root: &Path, mode: u32) -> std::io::Result<()> {
    std::fs::create_dir_all(leaf)?;
    let mut current = leaf.to_path_buf();
    loop {
        std::fs::set_permissions(&current, std::fs::Permissions::from_mode(mode))?;
        if current == root {
            break;
        }
        match current.parent() {
            Some(parent) if parent.starts_with(root) => current = parent.to_path_buf(),
            _ => break,
        }
    }
    Ok(())
}

/// A declared additional path must be absolute, must lexically clean to
/// somewhere strictly inside `mount_home`, and must contain no `..`
/// component that would escape it.
fn resolve_additional(mount_home: &Path, declared: &str) -> Result<PathBuf, &'static str> {
    let declared_path = Path::new(declared);
    if !declared_path.is_absolute() {
        return Err("path must be absolute");
    }

    let normalized = lexically_normalize(declared_path).ok_or("path traversal escapes root")?;

    if normalized == mount_home {
        return Err("path must not equal mount home itself");
    }
    if !normalized.starts_with(mount_home) {
        return Err("path is not within mount home");
    }
    Ok(normalized)
}

/// Collapse `.`/`..` components structurally, without touching the
/// filesystem. Returns `None` if a `..` would climb past the root.
fn lexically_normalize(path: &Path) -> Option<PathBuf> {
    let mut stack: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match stack.last() {
                Some(Component::Normal(_)) => {
                    stack.pop();
                }
                Some(Component::RootDir) | None => return None,
                _ => {
                    stack.pop();
                }
            },
            other => stack.push(other),
        }
    }
    Some(stack.iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_path() {
        let home = Path::new("/home/sandbox");
        assert!(resolve_additional(home, "relative/cache").is_err());
    }

    #[test]
    fn rejects_parent_traversal_past_root() {
        let home = Path::new("/home/sandbox");
        assert!(resolve_additional(home, "/home/sandbox/../../etc").is_err());
    }

    #[test]
    fn rejects_mount_home_itself() {
        let home = Path::new("/home/sandbox");
        assert!(resolve_additional(home, "/home/sandbox").is_err());
    }

    #[test]
    fn accepts_absolute_nested_path_with_dots() {
        let home = Path::new("/home/sandbox");
        let resolved = resolve_additional(home, "/home/sandbox/a/../.cache/pip").unwrap();
        assert_eq!(resolved, Path::new("/home/sandbox/.cache/pip"));
    }

    #[test]
    fn rejects_sibling_outside_mount_home() {
        let home = Path::new("/home/sandbox");
        assert!(resolve_additional(home, "/home/other/.cache").is_err());
    }
}
