//! First-boot home template copy, and additive sync on later boots.

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;

use walkdir::WalkDir;

use crate::config::Paths;
use crate::error::InitError;
use crate::user::UserRecord;

pub fn init(paths: &Paths, user: &UserRecord) -> Result<(), InitError> {
    if !paths.base_home.exists() {
        tracing::info!(base_home = %paths.base_home.display(), "first boot: copying image home template");
        copy_tree(&paths.image_home, &paths.base_home)
            .map_err(|e| InitError::stage(&paths.base_home, e))?;
        chown_tree(&paths.base_home, user.uid, user.gid)
            .map_err(|e| InitError::stage(&paths.base_home, e))?;
        return Ok(());
    }

    additive_sync(&paths.image_home, &paths.base_home)
        .map_err(|e| InitError::stage(&paths.base_home, e))
}

/// Recursively copy `src` to `dst`, preserving file mode and replicating
/// symlinks as symlinks rather than following them.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    if !src.exists() {
        fs::create_dir_all(dst)?;
        return Ok(());
    }

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let rel = entry.path().strip_prefix(src).expect("entry under src");
        let target = dst.join(rel);
        copy_entry(entry.path(), &target, entry.file_type())?;
    }

    Ok(())
}

fn copy_entry(src: &Path, dst: &Path, ft: fs::FileType) -> std::io::Result<()> {
    if ft.is_symlink() {
        let link_target = fs::read_link(src)?;
        if dst.symlink_metadata().is_err() {
            symlink(link_target, dst)?;
        }
    } else if ft.is_dir() {
        fs::create_dir_all(dst)?;
        let mode = fs::symlink_metadata(src)?.permissions().mode();
        fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        let mode = fs::metadata(src)?.permissions().mode();
        fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

/// For every entry present under `src` but absent under `dst`, copy it.
/// Entries already present under `dst` are never overwritten, preserving
/// any edits the user made across image upgrades.
fn additive_sync(src: &Path, dst: &Path) -> std::io::Result<()> {
    if !src.exists() {
        return Ok(());
    }

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let rel = entry.path().strip_prefix(src).expect("entry under src");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if target.symlink_metadata().is_ok() {
            continue;
        }
        copy_entry(entry.path(), &target, entry.file_type())?;
    }

    Ok(())
}

fn chown_tree(root: &Path, uid: nix::unistd::Uid, gid: nix::unistd::Gid) -> std::io::Result<()> {
    crate::platform::chown_path(root, uid, gid)?;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        crate::platform::chown_path(entry.path(), uid, gid)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt as _;
    use tempfile::tempdir;

    #[test]
    fn copy_tree_preserves_mode_and_symlinks() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("file.txt"), b"hi").unwrap();
        fs::set_permissions(src.path().join("file.txt"), fs::Permissions::from_mode(0o640)).unwrap();
        symlink("file.txt", src.path().join("link")).unwrap();

        copy_tree(src.path(), dst.path()).unwrap();

        assert_eq!(fs::read(dst.path().join("file.txt")).unwrap(), b"hi");
        let mode = fs::metadata(dst.path().join("file.txt")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
        let link = fs::read_link(dst.path().join("link")).unwrap();
        assert_eq!(link, Path::new("file.txt"));
    }

    #[test]
    fn additive_sync_never_overwrites_existing() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"from-image").unwrap();
        fs::write(dst.path().join("a.txt"), b"user-edit").unwrap();
        fs::write(src.path().join("b.txt"), b"new-in-image").unwrap();

        additive_sync(src.path(), dst.path()).unwrap();

        assert_eq!(fs::read(dst.path().join("a.txt")).unwrap(), b"user-edit");
        assert_eq!(fs::read(dst.path().join("b.txt")).unwrap(), b"new-in-image");
    }
}
