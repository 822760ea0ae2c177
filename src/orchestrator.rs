//! Orchestrator. Sequences every phase, times each one, and parks on
//! a fatal failure instead of exiting, so an operator can attach and
//! investigate. Times each stage with a `tracing`-routed phase timer.

use std::time::Instant;

use tokio::signal::unix::{signal, SignalKind};

use crate::ca;
use crate::config::Config;
use crate::envbuild;
use crate::envfix;
use crate::error::InitError;
use crate::pid1;
use crate::stager;
use crate::supervisor::{container_daemon, proxy, AuxHandle};
use crate::user;

struct PhaseTimer {
    last: Instant,
}

impl PhaseTimer {
    fn new() -> Self {
        Self { last: Instant::now() }
    }

    fn begin(&mut self, stage: &str) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        tracing::info!(stage, elapsed_ms = elapsed.as_millis() as u64, "phase");
        self.last = now;
    }
}

/// Runs every boot phase in order. Returns the exit code to propagate once the
/// agent and all auxiliaries have shut down. Never returns on a fatal
/// setup failure: it parks instead (see `park`).
pub async fn run(config: Config) -> i32 {
    let mut timer = PhaseTimer::new();

    if let Err(e) = std::env::set_current_dir("/") {
        park(&format!("chdir(/) failed: {e}")).await;
    }

    timer.begin("env fixups");
    envfix::run();

    timer.begin("resolve user");
    let user = match user::resolve(&config.run_as_user) {
        Ok(u) => u,
        Err(e) => {
            park(&format!("failed to resolve run-as user {}: {e}", config.run_as_user)).await;
            unreachable!();
        }
    };
    let paths = config.paths(&user.home_dir);

    timer.begin("stage filesystem");
    let staged = match stager::stage(&config, &paths, &user).await {
        Ok(s) => s,
        Err(e) => {
            park(&format!("filesystem staging failed: {e}")).await;
            unreachable!();
        }
    };
    tracing::info!(backend = ?staged.backend, "filesystem ready");

    timer.begin("CA provisioning");
    let ca_files = match ca::provision(&paths.proxy_dir, user.uid, user.gid, crate::config::PRODUCT).await {
        Ok(f) => Some(f),
        Err(e) => {
            tracing::warn!(error = %e, "CA provisioning failed, proxy will not be started");
            None
        }
    };

    let mut auxiliaries: Vec<AuxHandle> = Vec::new();
    let mut proxy_env: Option<Vec<(String, String)>> = None;

    timer.begin("start proxy");
    if let Some(ca_files) = &ca_files {
        match proxy::start(&paths, &user, &ca_files.cert_path).await {
            Ok(handle) => {
                proxy_env = Some(proxy::env_vars(&handle.ca_cert_path));
                auxiliaries.push(handle.aux);
            }
            Err(e) => tracing::warn!(error = %e, "proxy did not become ready, continuing without it"),
        }
    }

    timer.begin("start container daemon");
    match container_daemon::start(&paths, &user, proxy_env.as_deref()).await {
        Ok(Some(handle)) => auxiliaries.push(handle),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "container daemon did not become ready, continuing without it"),
    }

    timer.begin("build agent environment");
    let env = envbuild::build(&user, &paths.mount_home, proxy_env.as_deref());
    let workdir = paths.mount_home.join("workspace");

    timer.begin("start agent");
    auxiliaries.reverse(); // stop in reverse of start order: daemon before proxy
    let exit_code = match pid1::run(&config.agent_bin, &[], env, &user, &workdir, auxiliaries).await {
        Ok(code) => code,
        Err(e) => {
            park(&format!("failed to spawn agent {}: {e}", config.agent_bin.display())).await;
            unreachable!();
        }
    };

    exit_code
}

/// Print a diagnostic, then block on a signal channel forever. Never exits
/// with a non-zero status from a setup phase; an operator must attach.
async fn park(diagnostic: &str) -> ! {
    tracing::error!(diagnostic, "fatal setup failure, parking for operator investigation");

    let mut sigterm = signal(SignalKind::terminate()).expect("install sigterm handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install sigint handler");

    loop {
        tokio::select! {
            _ = sigterm.recv() => tracing::warn!("ignoring sigterm while parked"),
            _ = sigint.recv() => tracing::warn!("ignoring sigint while parked"),
        }
    }
}

