//! Resolve a username to the credential set the rest of the core
//! needs before it can touch anything on disk owned by the unprivileged user.

use std::path::PathBuf;

use nix::unistd::{Gid, Uid, User};

use crate::error::InitError;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub uid: Uid,
    pub gid: Gid,
    pub supplementary_gids: Vec<Gid>,
    pub home_dir: PathBuf,
}

/// Resolve `username` via NSS. Supplementary-gid lookup failure is non-fatal
/// (an empty list is used); an unknown username is fatal.
pub fn resolve(username: &str) -> Result<UserRecord, InitError> {
    let user = User::from_name(username)
        .map_err(|e| InitError::platform("getpwnam", username, e))?
        .ok_or_else(|| InitError::Config(format!("unknown user: {username}")))?;

    let supplementary_gids = supplementary_gids(username, user.gid).unwrap_or_else(|e| {
        tracing::warn!(username, error = %e, "failed to resolve supplementary groups, continuing with none");
        Vec::new()
    });

    Ok(UserRecord {
        username: username.to_string(),
        uid: user.uid,
        gid: user.gid,
        supplementary_gids,
        home_dir: user.dir,
    })
}

fn supplementary_gids(username: &str, primary_gid: Gid) -> Result<Vec<Gid>, InitError> {
    let cname = std::ffi::CString::new(username)
        .map_err(|_| InitError::Config(format!("username contains NUL: {username}")))?;

    // First call with a small buffer to discover the real count.
    let mut ngroups: libc::c_int = 16;
    let mut buf: Vec<libc::gid_t> = vec![0; ngroups as usize];

    loop {
        let res = unsafe {
            libc::getgrouplist(
                cname.as_ptr(),
                primary_gid.as_raw(),
                buf.as_mut_ptr(),
                &mut ngroups,
            )
        };
        if res >= 0 {
            buf.truncate(ngroups as usize);
            return Ok(buf.into_iter().map(Gid::from_raw).collect());
        }
        // ngroups was updated to the required size; retry once.
        if (buf.len() as libc::c_int) >= ngroups && ngroups > buf.len() as libc::c_int {
            break;
        }
        buf.resize(ngroups.max(buf.len() as libc::c_int * 2) as usize, 0);
        if buf.len() > 4096 {
            break;
        }
    }

    Err(InitError::platform(
        "getgrouplist",
        username,
        nix::Error::EINVAL,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_unknown_user_fails() {
        let res = resolve("definitely-not-a-real-user-xyz123");
        assert!(res.is_err());
    }

    #[test]
    fn resolve_root_succeeds() {
        let rec = resolve("root").expect("root always exists");
        assert_eq!(rec.uid, Uid::from_raw(0));
    }
}
