//! Platform primitives.
//!
//! Every privileged syscall the core performs is confined to this module so
//! the rest of the crate can be reasoned about as ordinary, testable code.
//! Grounded on `vinit`'s `mount`/`bind_mount`/`mount_common` helpers
//! (startup.rs) and its `sysctl` helper (helpers.rs).

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use nix::mount::{mount as nix_mount, umount2, MntFlags, MsFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{Gid, Pid, Uid};

use crate::error::InitError;

/// `mount(2)`. `fstype = None` with `MS_BIND` set in `flags` performs a bind mount.
pub fn mount(
    source: Option<&str>,
    target: &str,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<(), InitError> {
    nix_mount(source, target, fstype, flags, data)
        .map_err(|e| InitError::platform("mount", target, e))
}

pub fn bind_mount(source: &str, target: &str) -> Result<(), InitError> {
    mount(Some(source), target, None, MsFlags::MS_BIND, None)
}

pub fn umount(target: &str, flags: MntFlags) -> Result<(), InitError> {
    umount2(target, flags).map_err(|e| InitError::platform("umount", target, e))
}

/// Best-effort unmount used from panic-safe cleanup paths: never panics, only logs.
pub fn umount_best_effort(target: &str) {
    if let Err(e) = umount(target, MntFlags::empty()) {
        tracing::warn!(target_path = target, error = %e, "best-effort unmount failed");
    }
}

/// Reap exactly one exited child without blocking. Returns `None` once no
/// child is immediately reapable (mirrors `WNOHANG` semantics).
pub fn wait_any_nonblocking() -> Option<(Pid, i32)> {
    match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(pid, code)) => Some((pid, code)),
        Ok(WaitStatus::Signaled(pid, sig, _)) => Some((pid, 128 + sig as i32)),
        Ok(_) => None,
        Err(_) => None,
    }
}

/// Send `signal` to every process in group `pgid` (negative-pid convention).
pub fn kill_process_group(pgid: Pid, signal: Signal) -> Result<(), InitError> {
    kill(Pid::from_raw(-pgid.as_raw()), signal)
        .map_err(|e| InitError::platform("kill_process_group", pgid.as_raw().to_string(), e))
}

pub fn process_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

/// Credentials and process attributes applied atomically between `fork` and
/// `execve` via `pre_exec`. All four of {uid/gid/supplementary groups,
/// parent-death signal, new process group} land in the child before exec.
pub struct SpawnCredentials {
    pub uid: Uid,
    pub gid: Gid,
    pub supplementary_gids: Vec<Gid>,
    pub pdeathsig: Option<Signal>,
    pub new_process_group: bool,
}

pub fn spawn_with_credentials(
    mut cmd: Command,
    creds: &SpawnCredentials,
) -> std::io::Result<Child> {
    let uid = creds.uid.as_raw();
    let gid = creds.gid.as_raw();
    let gids: Vec<libc::gid_t> = creds.supplementary_gids.iter().map(|g| g.as_raw()).collect();
    let pdeathsig = creds.pdeathsig.map(|s| s as i32);
    let new_pg = creds.new_process_group;

    cmd.stdin(Stdio::null());

    unsafe {
        cmd.pre_exec(move || {
            if new_pg {
                set_new_process_group()?;
            }
            if let Some(sig) = pdeathsig {
                set_parent_death_signal_raw(sig)?;
            }
            if !gids.is_empty() {
                if libc::setgroups(gids.len(), gids.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            } else {
                // drop supplementary groups even when the caller has none to add
                if libc::setgroups(0, std::ptr::null()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if libc::setgid(gid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setuid(uid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn()
}

fn set_new_process_group() -> std::io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Applied in the child after fork, before exec: the kernel delivers `sig` to
/// this process if its parent dies first.
pub fn set_parent_death_signal_raw(sig: i32) -> std::io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, sig as libc::c_ulong) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Write a kernel sysctl via its `/proc/sys` interface (equivalent to
/// `sysctl -w name=value`), returning the underlying I/O error on failure.
pub fn write_sysctl(name: &str, value: &str) -> Result<(), InitError> {
    let path = format!("/proc/sys/{}", name.replace('.', "/"));
    std::fs::write(&path, value).map_err(|e| InitError::stage(path, e))
}

pub fn ensure_dir_owned(path: &Path, uid: Uid, gid: Gid) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    chown_path(path, uid, gid)
}

pub fn chown_path(path: &Path, uid: Uid, gid: Gid) -> std::io::Result<()> {
    nix::unistd::chown(path, Some(uid), Some(gid))
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}
