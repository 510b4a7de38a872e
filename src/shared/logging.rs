use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the tracing subscriber: console always, plus a daily rolling file
/// when `log_dir` is writable.
pub fn init_service_logging(log_dir: &str, service_name: &str) -> Result<(), anyhow::Error> {
    // RUST_LOG wins over the default level
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Console goes to stderr; stdout carries only answers
    let (non_blocking_console, console_guard) = non_blocking(std::io::stderr());

    if log_dir_writable(log_dir) {
        use tracing_appender::rolling;

        let _ = rotate_logs_on_startup(log_dir, service_name);

        let file_appender = rolling::daily(log_dir, format!("{service_name}.log"));
        let (non_blocking_file, file_guard) = non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);

        let console_layer = fmt::layer()
            .with_writer(non_blocking_console)
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init()?;

        // Guards must outlive the process or buffered lines are dropped
        std::mem::forget(file_guard);
        std::mem::forget(console_guard);

        info!("Logging initialized - logs will be written to {log_dir}/{service_name}.log.<date>");
    } else {
        let console_layer = fmt::layer()
            .with_writer(non_blocking_console)
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()?;

        std::mem::forget(console_guard);

        info!("Logging initialized - console output only (could not create log directory)");
    }

    Ok(())
}

fn log_dir_writable(log_dir: &str) -> bool {
    let probe = format!("{log_dir}/.test_write");
    std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::File::create(&probe))
        .map(|_| std::fs::remove_file(&probe))
        .is_ok()
}

/// Moves today's file from the daily appender (`<service>.log.YYYY-MM-DD`)
/// aside so each run starts a fresh one.
pub fn rotate_logs_on_startup(log_dir: &str, service_name: &str) -> Result<(), anyhow::Error> {
    let today = chrono::Utc::now().format("%Y-%m-%d");
    let log_file = format!("{log_dir}/{service_name}.log.{today}");
    let log_path = Path::new(&log_file);

    if log_path.exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_file = format!("{log_dir}/{service_name}.{timestamp}.log");

        std::fs::rename(&log_file, &backup_file)?;
        info!("Previous log file backed up to: {backup_file}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_moves_todays_daily_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().to_str().unwrap();
        let today = chrono::Utc::now().format("%Y-%m-%d");
        let current = dir.path().join(format!("insight.log.{today}"));
        std::fs::write(&current, "previous run\n").unwrap();

        rotate_logs_on_startup(log_dir, "insight").unwrap();

        assert!(!current.exists());
        let backups: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].starts_with("insight.") && backups[0].ends_with(".log"));
    }

    #[test]
    fn rotation_without_a_current_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        rotate_logs_on_startup(dir.path().to_str().unwrap(), "insight").unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
