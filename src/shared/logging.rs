use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging: console always (stderr, stdout carries the answer),
/// plus a `{service_name}.log` file when `log_dir` is set and writable. The
/// previous run's file is moved aside to a timestamped backup first.
///
/// The returned guards flush buffered lines when dropped; keep them alive
/// until the process exits.
pub fn init_logging(
    log_dir: Option<&Path>,
    service_name: &str,
    verbose: bool,
) -> Result<Vec<WorkerGuard>, anyhow::Error> {
    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let writable_dir = log_dir.filter(|dir| can_write(dir));

    match writable_dir {
        Some(dir) => {
            use tracing_appender::rolling;

            let _ = rotate_logs_on_startup(dir, service_name);

            // Rotated per run above; the appender itself never rolls
            let file_appender = rolling::never(dir, format!("{service_name}.log"));
            let (non_blocking_file, guard_file) = non_blocking(file_appender);

            let file_layer = fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            let (non_blocking_stderr, guard_stderr) = non_blocking(std::io::stderr());
            let console_layer = fmt::layer()
                .with_writer(non_blocking_stderr)
                .with_ansi(true)
                .with_target(false)
                .with_thread_ids(false)
                .with_line_number(false);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer)
                .try_init()?;

            info!(
                "Logging initialized - logs will be written to {}/{service_name}.log",
                dir.display()
            );
            Ok(vec![guard_file, guard_stderr])
        }
        None => {
            let (non_blocking_stderr, guard_stderr) = non_blocking(std::io::stderr());
            let console_layer = fmt::layer()
                .with_writer(non_blocking_stderr)
                .with_ansi(true)
                .with_target(false)
                .with_thread_ids(false)
                .with_line_number(false);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init()?;

            if let Some(dir) = log_dir {
                info!(
                    "Logging initialized - console output only (could not write to {})",
                    dir.display()
                );
            }
            Ok(vec![guard_stderr])
        }
    }
}

fn can_write(dir: &Path) -> bool {
    let probe = dir.join(".test_write");
    std::fs::create_dir_all(dir)
        .and_then(|_| std::fs::File::create(&probe))
        .and_then(|_| std::fs::remove_file(&probe))
        .is_ok()
}

pub fn rotate_logs_on_startup(log_dir: &Path, service_name: &str) -> Result<(), anyhow::Error> {
    let log_path = log_dir.join(format!("{service_name}.log"));

    if log_path.exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = log_dir.join(format!("{service_name}.{timestamp}.log"));

        std::fs::rename(&log_path, &backup_path)?;
        info!("Previous log file backed up to: {}", backup_path.display());
    }

    Ok(())
}
