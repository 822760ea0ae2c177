mod ca;
mod config;
mod envbuild;
mod envfix;
mod error;
mod orchestrator;
mod pid1;
mod pidfd;
mod platform;
mod stager;
mod supervisor;
mod user;

use tracing_subscriber::EnvFilter;

use config::Config;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            init_fallback_logging();
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    init_logging(config.log_json);

    tracing::info!(session_id = %config.session_id, "starting sandboxd-init");

    let exit_code = orchestrator::run(config).await;
    std::process::exit(exit_code);
}

/// `tracing-subscriber` with an `EnvFilter` read from `RUST_LOG`
/// (default `info`), formatter chosen by `SANDBOXD_LOG_FORMAT`.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn init_fallback_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
