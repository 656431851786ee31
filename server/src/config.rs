use std::{env, fs, path::PathBuf, time::Duration};

use warden_common::{
    binary_hash::current_binary_hash,
    config::{env_flag, env_list, env_parse},
};

/// Scopes granted to every authenticated helper.
pub const DEFAULT_SCOPES: &[&str] = &["notify", "tray", "clipboard", "desktop", "run_as_user"];

pub const DEFAULT_RATE_LIMIT_ATTEMPTS: usize = 5;
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Live sessions one identity may hold at once.
pub const DEFAULT_MAX_SESSIONS_PER_IDENTITY: usize = 3;
/// Helpers silent for this long are disconnected.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Allowed helper binary hashes.
///
/// This is broker-only configuration; nothing a helper sends can change it.
#[derive(Debug, Clone, Default)]
pub struct HelperHashPolicy {
    /// List of allowed hashes (lowercase hex SHA-256)
    allowed_hashes:     Vec<String>,
    /// Whether to enforce hash validation (can be disabled for development)
    enforce_validation: bool,
}

impl HelperHashPolicy {
    /// Enforces that helpers present one of `hashes`.
    pub fn enforced<I, S>(hashes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_hashes:     hashes
                .into_iter()
                .map(|h| h.into().to_lowercase())
                .collect(),
            enforce_validation: true,
        }
    }

    /// Accepts any hash. For development builds where helper and broker are
    /// different binaries.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Helpers must be the same build as the running broker.
    ///
    /// Falls back to [`HelperHashPolicy::disabled`] when our own executable
    /// cannot be hashed.
    pub fn current_binary() -> Self {
        match current_binary_hash() {
            Ok(hash) => Self::enforced([hash]),
            Err(e) => {
                tracing::warn!(error = %e, "⚠️  Could not hash own executable, helper hash check disabled");
                Self::disabled()
            }
        }
    }

    /// Reads `WARDEN_HELPER_BINARY_HASHES` and `WARDEN_ENFORCE_HELPER_HASH`,
    /// starting from [`HelperHashPolicy::current_binary`] when no hashes are
    /// listed.
    pub fn from_env() -> Self {
        let mut policy = match env_list("WARDEN_HELPER_BINARY_HASHES") {
            Some(hashes) => Self::enforced(hashes),
            None => Self::current_binary(),
        };
        if let Some(enforce) = env_flag("WARDEN_ENFORCE_HELPER_HASH") {
            policy.enforce_validation = enforce;
        }
        policy
    }

    /// Check if a hash is allowed
    pub fn is_hash_allowed<S: AsRef<str>>(&self, hash: S) -> bool {
        if !self.enforce_validation {
            return true;
        }

        let hash = hash.as_ref().to_lowercase();
        !hash.is_empty() && self.allowed_hashes.iter().any(|allowed| *allowed == hash)
    }

    /// Get all allowed hashes
    pub fn allowed_hashes(&self) -> &[String] {
        &self.allowed_hashes
    }

    /// Check if validation is enforced
    pub fn is_validation_enforced(&self) -> bool {
        self.enforce_validation
    }
}

/// Which executables may act as helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperPathPolicy {
    /// Any executable the kernel reports
    Any,
    /// Only these executables; an empty list admits nobody
    AllowList(Vec<PathBuf>),
}

impl Default for HelperPathPolicy {
    fn default() -> Self {
        Self::current_binary()
    }
}

impl HelperPathPolicy {
    /// Only the running broker's own executable, with symlinks resolved.
    ///
    /// Admits nobody when our own path cannot be determined.
    pub fn current_binary() -> Self {
        match env::current_exe().and_then(fs::canonicalize) {
            Ok(path) => Self::AllowList(vec![path]),
            Err(e) => {
                tracing::warn!(error = %e, "⚠️  Could not resolve own executable path, no helper path will verify");
                Self::AllowList(Vec::new())
            }
        }
    }

    /// Reads `WARDEN_HELPER_PATHS`; a `*` entry allows any executable.
    fn from_env() -> Option<Self> {
        let paths = env_list("WARDEN_HELPER_PATHS")?;
        if paths.iter().any(|p| p == "*") {
            return Some(Self::Any);
        }
        Some(Self::AllowList(paths.into_iter().map(PathBuf::from).collect()))
    }
}

/// Broker policy knobs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Connection attempts allowed per identity within `rate_limit_window`
    pub rate_limit_attempts:       usize,
    pub rate_limit_window:         Duration,
    /// Read/write timeout while the handshake is in progress
    pub handshake_timeout:         Duration,
    /// Reject peers whose executable path the OS could not report
    pub require_verified_path:     bool,
    /// Executables allowed to connect; defaults to our own
    pub helper_paths:              HelperPathPolicy,
    /// Hashes helpers may claim; defaults to our own
    pub helper_hashes:             HelperHashPolicy,
    /// Live sessions allowed per identity
    pub max_sessions_per_identity: usize,
    /// Sessions that receive nothing for this long are closed by the reaper
    pub idle_timeout:              Duration,
    /// How often the idle reaper looks for idle sessions
    pub idle_check_interval:       Duration,
    /// Reported to helpers in the auth response
    pub agent_id:                  String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            rate_limit_attempts:       DEFAULT_RATE_LIMIT_ATTEMPTS,
            rate_limit_window:         DEFAULT_RATE_LIMIT_WINDOW,
            handshake_timeout:         DEFAULT_HANDSHAKE_TIMEOUT,
            require_verified_path:     true,
            helper_paths:              HelperPathPolicy::current_binary(),
            helper_hashes:             HelperHashPolicy::current_binary(),
            max_sessions_per_identity: DEFAULT_MAX_SESSIONS_PER_IDENTITY,
            idle_timeout:              DEFAULT_IDLE_TIMEOUT,
            idle_check_interval:       DEFAULT_IDLE_CHECK_INTERVAL,
            agent_id:                  String::new(),
        }
    }
}

impl BrokerConfig {
    /// Creates a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables, falling back to
    /// the defaults for anything unset or malformed.
    pub fn from_env() -> Self {
        Self {
            rate_limit_attempts:       env_parse("WARDEN_RATE_LIMIT_ATTEMPTS")
                .unwrap_or(DEFAULT_RATE_LIMIT_ATTEMPTS),
            rate_limit_window:         env_parse("WARDEN_RATE_LIMIT_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW),
            handshake_timeout:         env_parse("WARDEN_HANDSHAKE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT),
            require_verified_path:     env_flag("WARDEN_REQUIRE_VERIFIED_PATH").unwrap_or(true),
            helper_paths:              HelperPathPolicy::from_env()
                .unwrap_or_else(HelperPathPolicy::current_binary),
            helper_hashes:             HelperHashPolicy::from_env(),
            max_sessions_per_identity: env_parse("WARDEN_MAX_SESSIONS_PER_IDENTITY")
                .unwrap_or(DEFAULT_MAX_SESSIONS_PER_IDENTITY),
            idle_timeout:              env_parse("WARDEN_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
            idle_check_interval:       DEFAULT_IDLE_CHECK_INTERVAL,
            agent_id:                  String::new(),
        }
    }

    /// Set the rate limit
    pub fn with_rate_limit(mut self, attempts: usize, window: Duration) -> Self {
        self.rate_limit_attempts = attempts;
        self.rate_limit_window = window;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Require (or not) a kernel-verified executable path
    pub fn with_require_verified_path(mut self, require: bool) -> Self {
        self.require_verified_path = require;
        self
    }

    /// Add an allowed helper executable
    pub fn with_helper_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        let path = path.into();
        if let HelperPathPolicy::AllowList(paths) = &mut self.helper_paths {
            paths.push(path);
        } else {
            self.helper_paths = HelperPathPolicy::AllowList(vec![path]);
        }
        self
    }

    /// Replace the allowed helper executables
    pub fn with_helper_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.helper_paths = HelperPathPolicy::AllowList(paths.into_iter().map(Into::into).collect());
        self
    }

    /// Accept helpers from any executable path
    pub fn allow_any_helper_path(mut self) -> Self {
        self.helper_paths = HelperPathPolicy::Any;
        self
    }

    /// Set the helper hash policy
    pub fn with_helper_hashes(mut self, policy: HelperHashPolicy) -> Self {
        self.helper_hashes = policy;
        self
    }

    /// Set how many live sessions one identity may hold
    pub fn with_max_sessions_per_identity(mut self, max: usize) -> Self {
        self.max_sessions_per_identity = max;
        self
    }

    /// Set the idle cutoff and how often it is checked
    pub fn with_idle_timeout(mut self, timeout: Duration, check_interval: Duration) -> Self {
        self.idle_timeout = timeout;
        self.idle_check_interval = check_interval;
        self
    }

    /// Set the agent id reported to helpers
    pub fn with_agent_id<S: Into<String>>(mut self, agent_id: S) -> Self {
        self.agent_id = agent_id.into();
        self
    }
}
