//! PID-1 loop: spawn the agent, forward signals to its process group,
//! reap orphans, and coordinate shutdown of the agent and auxiliaries.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::T_SHUTDOWN_SECS;
use crate::pidfd::PidFd;
use crate::platform::{self, SpawnCredentials};
use crate::supervisor::{shutdown, AuxHandle};
use crate::user::UserRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Terminating,
    Killing,
    Draining,
}

/// Spawn `agent_bin` under `user`'s credentials with a fresh process group
/// and a `SIGTERM` parent-death signal, then run the PID-1 select loop until
/// it exits, tearing down `auxiliaries` (LIFO) before returning.
///
/// Returns the exit code to propagate to the real parent.
pub async fn run(
    agent_bin: &Path,
    args: &[String],
    env: Vec<(String, String)>,
    user: &UserRecord,
    workdir: &Path,
    auxiliaries: Vec<AuxHandle>,
) -> std::io::Result<i32> {
    let mut cmd = Command::new(agent_bin);
    cmd.args(args);
    cmd.current_dir(workdir);
    cmd.env_clear();
    for (k, v) in &env {
        cmd.env(k, v);
    }

    let creds = SpawnCredentials {
        uid: user.uid,
        gid: user.gid,
        supplementary_gids: user.supplementary_gids.clone(),
        pdeathsig: Some(Signal::SIGTERM),
        new_process_group: true,
    };

    let child = platform::spawn_with_credentials(cmd, &creds)?;
    let pid = Pid::from_raw(child.id() as i32);
    drop(child);
    tracing::info!(pid = pid.as_raw(), "agent started");

    let pidfd = PidFd::open(pid.as_raw())?;
    select_loop(pid, pidfd, auxiliaries).await
}

async fn select_loop(pid: Pid, pidfd: PidFd, auxiliaries: Vec<AuxHandle>) -> std::io::Result<i32> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigchld = signal(SignalKind::child())?;

    let mut state = State::Running;
    let mut deadline: Option<tokio::time::Instant> = None;
    let mut agent_exit_code: Option<i32> = None;

    loop {
        tokio::select! {
            _ = pidfd.wait() => {
                tracing::info!("agent exited");
                break;
            }
            _ = sigterm.recv() => handle_terminating_signal(pid, &mut state, &mut deadline),
            _ = sigint.recv() => handle_terminating_signal(pid, &mut state, &mut deadline),
            _ = sigquit.recv() => handle_terminating_signal(pid, &mut state, &mut deadline),
            _ = sighup.recv() => {
                tracing::debug!("forwarding sighup to agent process group");
                let _ = platform::kill_process_group(pid, Signal::SIGHUP);
            }
            _ = sleep_until_deadline(deadline) => {
                tracing::warn!("shutdown deadline elapsed, sending sigkill");
                state = State::Killing;
                let _ = platform::kill_process_group(pid, Signal::SIGKILL);
                deadline = None;
            }
            _ = sigchld.recv() => {
                if let Some(code) = reap_orphans_except(pid) {
                    tracing::info!("agent exited");
                    agent_exit_code = Some(code);
                    break;
                }
            }
        }
    }

    tracing::debug!("draining: tearing down auxiliaries");

    // The orphan reaper above never waits on the agent's own pid, so if the
    // pidfd branch won the race the agent is still an un-reaped zombie here.
    let exit_code = agent_exit_code.unwrap_or_else(|| resolve_exit_code(pid));

    shutdown::stop_all(auxiliaries).await;
    reap_orphans();

    Ok(exit_code)
}

fn handle_terminating_signal(pid: Pid, state: &mut State, deadline: &mut Option<tokio::time::Instant>) {
    match *state {
        State::Running => {
            tracing::info!("terminating signal received, forwarding to agent process group");
            *state = State::Terminating;
            let _ = platform::kill_process_group(pid, Signal::SIGTERM);
            *deadline = Some(tokio::time::Instant::now() + Duration::from_secs(T_SHUTDOWN_SECS));
        }
        State::Terminating => {
            tracing::warn!("second terminating signal received, escalating to sigkill immediately");
            *state = State::Killing;
            let _ = platform::kill_process_group(pid, Signal::SIGKILL);
            *deadline = None;
        }
        State::Killing | State::Draining => {}
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn reap_orphans() {
    while platform::wait_any_nonblocking().is_some() {}
}

/// Reap every child that has already exited, same as `reap_orphans`, but
/// capture the agent's own exit code instead of silently discarding it:
/// `waitpid(-1, WNOHANG)` reaps whichever child it finds, so if the agent
/// happens to be among them here the caller must not wait on it again.
fn reap_orphans_except(agent_pid: Pid) -> Option<i32> {
    let mut agent_exit_code = None;
    while let Some((pid, code)) = platform::wait_any_nonblocking() {
        if pid == agent_pid {
            agent_exit_code = Some(code);
        }
    }
    agent_exit_code
}

/// The supervised agent has already exited by the time we ask; reap it to
/// get its real status rather than guessing from "process gone".
fn resolve_exit_code(pid: Pid) -> i32 {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(_, _, _)) => 1,
        _ => {
            if platform::process_alive(pid) {
                0
            } else {
                1
            }
        }
    }
}
