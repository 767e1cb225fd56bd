use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber.
///
/// Console output always, plus a daily rolling file under `$LOG_DIR` when that is set.
/// `log` records (reqwest, hyper) are forwarded into tracing.
/// Keep the returned guard alive for the life of the process or buffered file lines are lost.
pub fn init_logs() -> Option<WorkerGuard> {
    let _ = tracing_log::LogTracer::init();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,flashforge_client=debug"));

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_line_number(true)
        .pretty();

    let (file_layer, guard) = match std::env::var("LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "flashforge_client.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .json();
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    let res = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    if let Err(e) = res {
        eprintln!("logging already initialized: {}", e);
    }

    guard
}
