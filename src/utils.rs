use std::path::{Path, PathBuf};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{AppError, Result};

/// Install the global subscriber writing to `<log_dir>/hostdeck.log`.
///
/// `RUST_LOG` takes priority over `log_level`.
pub fn init_tracing(log_level: &str, log_dir: &Path) -> Result<()> {
    let file_appender = tracing_appender::rolling::never(log_dir, "hostdeck.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let fmt_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| AppError::Config(format!("Failed to initialize tracing: {}", e)))?;

    // Logging lives as long as the process.
    std::mem::forget(guard);

    Ok(())
}

/// Expand a leading `~/` to the current user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// Join a remote (always `/`-separated) directory and a child name.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Parent of a remote path, `None` for the root.
pub fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }

    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }

    match trimmed.rsplit_once('/') {
        Some(("", _)) => Some("/".to_string()),
        Some((parent, _)) => Some(parent.to_string()),
        None => Some(".".to_string()),
    }
}

/// True when `path` names the filesystem root.
pub fn is_root(path: &str) -> bool {
    !path.is_empty() && path.trim_end_matches('/').is_empty()
}

/// Quote a string for a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/"), None);
        assert_eq!(parent_of("/etc"), Some("/".to_string()));
        assert_eq!(parent_of("/etc/ssh/"), Some("/etc".to_string()));
        assert_eq!(parent_of("docs"), Some(".".to_string()));
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/", "etc"), "/etc");
        assert_eq!(join_remote("/home/u/", "a.txt"), "/home/u/a.txt");
        assert_eq!(join_remote("", "a.txt"), "a.txt");
    }

    #[test]
    fn test_is_root() {
        assert!(is_root("/"));
        assert!(is_root("//"));
        assert!(!is_root(""));
        assert!(!is_root("/tmp"));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
