//! Child environment construction: the parent environment with
//! `HOME`/`USER`/`LOGNAME` replaced by the target user's values, plus the
//! proxy variable set when the proxy is ready.

use std::path::Path;

use crate::user::UserRecord;

const OVERRIDDEN_VARS: &[&str] = &["HOME", "USER", "LOGNAME"];

pub fn build(user: &UserRecord, mount_home: &Path, proxy_env: Option<&[(String, String)]>) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(k, _)| !OVERRIDDEN_VARS.contains(&k.as_str()))
        .collect();

    env.push(("HOME".into(), mount_home.to_string_lossy().to_string()));
    env.push(("USER".into(), user.username.clone()));
    env.push(("LOGNAME".into(), user.username.clone()));

    if let Some(proxy_env) = proxy_env {
        env.extend(proxy_env.iter().cloned());
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{Gid, Uid};

    fn user() -> UserRecord {
        UserRecord {
            username: "sandbox".into(),
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
            supplementary_gids: vec![],
            home_dir: std::path::PathBuf::from("/home/sandbox"),
        }
    }

    #[test]
    fn overrides_identity_vars() {
        std::env::set_var("HOME", "/root");
        let env = build(&user(), Path::new("/home/sandbox"), None);
        let home = env.iter().find(|(k, _)| k == "HOME").unwrap();
        assert_eq!(home.1, "/home/sandbox");
        assert_eq!(env.iter().filter(|(k, _)| k == "HOME").count(), 1);
    }

    #[test]
    fn appends_proxy_vars_when_given() {
        let proxy_env = vec![("HTTP_PROXY".to_string(), "http://127.0.0.1:9090".to_string())];
        let env = build(&user(), Path::new("/home/sandbox"), Some(&proxy_env));
        assert!(env.iter().any(|(k, v)| k == "HTTP_PROXY" && v == "http://127.0.0.1:9090"));
    }

    #[test]
    fn omits_proxy_vars_when_not_ready() {
        let env = build(&user(), Path::new("/home/sandbox"), None);
        assert!(!env.iter().any(|(k, _)| k == "HTTP_PROXY"));
    }
}
