use anyhow::Result;
use std::fs;
use std::path::Path;

fn level_filter(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Logs to stdout and to `<log_dir>/<prefix>_<timestamp>.log`.
pub fn setup_logging(log_dir: &Path, log_level: &str, prefix: &str) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Clean up old log files, keeping only the most recent one
    cleanup_old_logs(log_dir, prefix)?;

    let log_file_name = format!("{}_{}.log", prefix, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level_filter(log_level))
        .chain(std::io::stdout())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}

/// Removes this binary's `.log` files except the newest one. Other binaries
/// sharing the directory are left alone.
fn cleanup_old_logs(log_dir: &Path, prefix: &str) -> Result<()> {
    let owned = format!("{}_", prefix);
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .filter(|e| e.file_name().to_string_lossy().starts_with(&owned))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e))
        })
        .collect();

    // Sort by modification time, newest first
    entries.sort_by_key(|(modified, _)| std::cmp::Reverse(*modified));

    // Keep the most recent one (index 0), delete the rest
    for (_, entry) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(entry.path()) {
            eprintln!("Failed to delete old log file {:?}: {}", entry.path(), e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_cleanup_keeps_newest_of_own_prefix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("coin_feed_1.log"), "old").unwrap();
        thread::sleep(Duration::from_millis(50));
        fs::write(dir.path().join("coin_feed_2.log"), "new").unwrap();
        fs::write(dir.path().join("redis2ws_1.log"), "other").unwrap();
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        cleanup_old_logs(dir.path(), "coin_feed").unwrap();

        assert!(!dir.path().join("coin_feed_1.log").exists());
        assert!(dir.path().join("coin_feed_2.log").exists());
        assert!(dir.path().join("redis2ws_1.log").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_level_names() {
        assert_eq!(level_filter("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(level_filter("off"), log::LevelFilter::Off);
        assert_eq!(level_filter("fatal"), log::LevelFilter::Info);
    }
}
