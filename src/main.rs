use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use bundlectl::config::{Home, load_config};
use bundlectl::context::Context;
use bundlectl::errors::{BundleError, ErrorKind};
use bundlectl::{cli, logging, run};

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        if err.kind() == ErrorKind::InvariantViolated {
            error!(error = ?err, "internal error");
            eprintln!("bundlectl internal error: {err:#}\n{err:?}");
        } else {
            eprintln!("bundlectl error: {err:#}");
        }
        std::process::exit(err.exit_code());
    }
}

async fn run_main() -> Result<(), BundleError> {
    let args = cli::parse();
    let home = match &args.home {
        Some(dir) => Home::new(dir),
        None => Home::from_env()?,
    };
    let config = load_config(&home)?;
    logging::init_logging(args.log_level, config.verbosity)?;

    // SIGINT / SIGTERM → cancel everything; in-flight actions get
    // `shutdown-timeout` to stop before they are recorded as canceled.
    let token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(token.clone()));

    let ctx = Context::new(token).with_shutdown_timeout(config.shutdown_timeout);
    run(ctx, home, config, args).await
}

async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
                return;
            }
        };
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    warn!(error = %e, "failed to listen for Ctrl+C");
                    return;
                }
            }
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
    }
    warn!("shutdown requested; cancelling in-flight work");
    token.cancel();
}
