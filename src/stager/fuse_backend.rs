//! FUSE-backed store mount. The store itself is an external helper
//! binary (explicit non-goal); this module only drives it as a subprocess.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::config::{Paths, FUSE_MOUNT_RETRIES};
use crate::error::InitError;
use crate::platform::{self, SpawnCredentials};
use crate::user::UserRecord;

const FUSE_STORE_BIN: &str = "fuse-store";
const RETRY_PAUSE: Duration = Duration::from_secs(1);

pub async fn mount(paths: &Paths, session_id: &str, user: &UserRecord, mount_target: &Path) -> Result<(), InitError> {
    platform::ensure_dir_owned(&paths.fuse_root, user.uid, user.gid)
        .map_err(|e| InitError::stage(&paths.fuse_root, e))?;

    let db_path = paths.session_fuse_db(session_id);
    if !db_path.exists() {
        run_as_user(
            user,
            &[FUSE_STORE_BIN, "init", "--base", &paths.base_home.to_string_lossy(), session_id],
        )
        .await?;
    }

    std::fs::create_dir_all(mount_target).map_err(|e| InitError::stage(mount_target, e))?;

    let mount_target_str = mount_target.to_string_lossy().to_string();
    let args: Vec<String> = vec![
        FUSE_STORE_BIN.to_string(),
        "mount".to_string(),
        "-a".to_string(),
        "--allow-root".to_string(),
        session_id.to_string(),
        mount_target_str,
    ];

    for attempt in 1..=FUSE_MOUNT_RETRIES {
        match run_as_user(user, &args.iter().map(String::as_str).collect::<Vec<_>>()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "fuse mount attempt failed, retrying");
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
    }

    // Final attempt in foreground so the helper's diagnostic output is captured.
    tracing::warn!("fuse mount exhausted retries, attempting one foreground run");
    run_as_user(user, &args.iter().map(String::as_str).collect::<Vec<_>>()).await
}

async fn run_as_user(user: &UserRecord, argv: &[&str]) -> Result<(), InitError> {
    let (program, rest) = argv.split_first().expect("non-empty argv");
    let program = program.to_string();
    let mut cmd = Command::new(&program);
    cmd.args(rest);
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    let creds = SpawnCredentials {
        uid: user.uid,
        gid: user.gid,
        supplementary_gids: user.supplementary_gids.clone(),
        pdeathsig: None,
        new_process_group: false,
    };

    let prog_for_err = program.clone();
    let status = tokio::task::spawn_blocking(move || {
        let mut child = platform::spawn_with_credentials(cmd, &creds)?;
        child.wait()
    })
    .await
    .map_err(|e| InitError::subprocess(prog_for_err.clone(), e.to_string()))?
    .map_err(|e| InitError::subprocess(prog_for_err.clone(), e.to_string()))?;

    if !status.success() {
        return Err(InitError::subprocess(program, format!("exited with {status}")));
    }
    Ok(())
}
