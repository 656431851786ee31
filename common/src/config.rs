use std::{env, path::PathBuf, str::FromStr};

/// Overrides the default socket location on every platform.
pub const SOCKET_PATH_ENV: &str = "WARDEN_SOCKET_PATH";

#[cfg(target_os = "linux")]
const DEFAULT_SOCKET_PATH: &str = "/var/run/warden/agent.sock";

#[cfg(target_os = "macos")]
const DEFAULT_SOCKET_PATH: &str = "/Library/Application Support/Warden/agent.sock";

#[cfg(windows)]
const DEFAULT_SOCKET_PATH: &str = r"\\.\pipe\warden-agent-ipc";

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
const DEFAULT_SOCKET_PATH: &str = "/var/run/warden/agent.sock";

/// Where the broker listens and the helper connects.
///
/// A named-pipe path on Windows, a socket file elsewhere.
pub fn default_socket_path() -> PathBuf {
    env::var(SOCKET_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_PATH))
}

/// Returns true if `path` names a Windows named pipe.
pub fn is_named_pipe_path(path: &str) -> bool {
    path.starts_with(r"\\.\pipe\")
}

/// Parses an environment variable, ignoring it when unset or malformed.
pub fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring malformed value for {}: {:?}", name, raw);
            None
        }
    }
}

/// Reads a boolean flag; only `true` (any case) and `1` enable it.
pub fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|value| matches!(value.trim().to_lowercase().as_str(), "true" | "1"))
}

/// Reads a comma separated list, dropping empty entries.
pub fn env_list(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|value| split_list(&value))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parsing_trims_and_drops_empties() {
        assert_eq!(
            split_list(" abc, ,def ,,"),
            vec!["abc".to_string(), "def".to_string()]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn named_pipe_paths() {
        assert!(is_named_pipe_path(r"\\.\pipe\warden-agent-ipc"));
        assert!(!is_named_pipe_path("/var/run/warden/agent.sock"));
    }

    #[test]
    fn unset_variables_are_none() {
        assert_eq!(env_parse::<u64>("WARDEN_TEST_DEFINITELY_UNSET"), None);
        assert_eq!(env_flag("WARDEN_TEST_DEFINITELY_UNSET"), None);
        assert_eq!(env_list("WARDEN_TEST_DEFINITELY_UNSET"), None);
    }
}
