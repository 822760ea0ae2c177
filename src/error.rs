use std::path::PathBuf;

/// Errors produced by any orchestrator phase, required or optional.
///
/// Every phase function returns `Result<T, InitError>` regardless of how
/// fatal a failure is; the orchestrator call site decides whether to park,
/// fall back, or log and continue degraded.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("platform operation failed: {op} on {target}: {source}")]
    Platform {
        op: &'static str,
        target: String,
        #[source]
        source: nix::Error,
    },

    #[error("filesystem staging failed at {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CA provisioning failed: {0}")]
    Crypto(String),

    #[error("missing required configuration: {0}")]
    Config(String),

    #[error("subprocess {cmd} failed: {detail}")]
    Subprocess { cmd: String, detail: String },

    #[error("{what} did not become ready within {timeout_secs}s")]
    Readiness { what: &'static str, timeout_secs: u64 },
}

impl InitError {
    pub fn platform(op: &'static str, target: impl Into<String>, source: nix::Error) -> Self {
        InitError::Platform { op, target: target.into(), source }
    }

    pub fn stage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        InitError::Stage { path: path.into(), source }
    }

    pub fn subprocess(cmd: impl Into<String>, detail: impl Into<String>) -> Self {
        InitError::Subprocess { cmd: cmd.into(), detail: detail.into() }
    }
}
