//! Runtime configuration.
//!
//! A proxy is loaded by a host that knows nothing about it, so there is no
//! command line to speak of: configuration comes from the environment.
//!
//! | Variable                         | Meaning                                            |
//! |----------------------------------|----------------------------------------------------|
//! | `UNIPROXY_GENUINE_PATH`          | Path (file or directory) of the genuine library    |
//! | `UNIPROXY_SEARCH_PATH`           | Extra directories to search, platform path list    |
//! | `UNIPROXY_UNRESOLVED`            | `block` (default) or `fail`                        |
//! | `UNIPROXY_UNRESOLVED_TIMEOUT_MS` | How long `block` waits, default 2000               |
//! | `UNIPROXY_DETACH_TIMEOUT_MS`     | How long detach waits for typed calls, default 2000 |
//! | `UNIPROXY_STRICT`                | `1` (default) rejects genuine exports not surfaced |
//! | `UNIPROXY_LOG`                   | `tracing` filter directives, default `info`        |
//! | `UNIPROXY_LOG_FILE`              | Log file path, default next to the proxy module    |

use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// What a typed export does when called before the genuine library is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedPolicy {
    /// Block the calling thread until attach completes, at most for the given
    /// duration.
    Block(Duration),
    /// Fail the call immediately.
    FailFast,
}

impl Default for UnresolvedPolicy {
    fn default() -> Self {
        UnresolvedPolicy::Block(DEFAULT_TIMEOUT)
    }
}

/// Proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Explicit location of the genuine library, searched first.
    pub genuine_path: Option<PathBuf>,
    /// Additional directories, searched in order before the system ones.
    pub search_paths: Vec<PathBuf>,
    /// Behavior of calls arriving before attach completes.
    pub unresolved: UnresolvedPolicy,
    /// Upper bound on the time detach waits for in-flight calls.
    pub detach_timeout: Duration,
    /// Whether genuine exports missing from the proxy surface fail the attach.
    pub strict: bool,
    /// Log filter directives.
    pub log_filter: String,
    /// Log file path. `None` logs next to the proxy module.
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            genuine_path: None,
            search_paths: Vec::new(),
            unresolved: UnresolvedPolicy::default(),
            detach_timeout: DEFAULT_TIMEOUT,
            strict: true,
            log_filter: "info".to_owned(),
            log_file: None,
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var_os(key))
    }

    /// Read the configuration through an arbitrary variable lookup.
    ///
    /// Invalid values are logged and replaced by their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let mut config = Config::default();
        let string = |key: &str| lookup(key).and_then(|value| value.into_string().ok());

        if let Some(path) = lookup("UNIPROXY_GENUINE_PATH").filter(|p| !p.is_empty()) {
            config.genuine_path = Some(PathBuf::from(path));
        }

        if let Some(paths) = lookup("UNIPROXY_SEARCH_PATH") {
            config.search_paths =
                env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()).collect();
        }

        let timeout = string("UNIPROXY_UNRESOLVED_TIMEOUT_MS")
            .and_then(|value| parse_millis("UNIPROXY_UNRESOLVED_TIMEOUT_MS", &value))
            .unwrap_or(DEFAULT_TIMEOUT);

        config.unresolved = match string("UNIPROXY_UNRESOLVED").as_deref() {
            None | Some("block") => UnresolvedPolicy::Block(timeout),
            Some("fail") => UnresolvedPolicy::FailFast,
            Some(other) => {
                warn!("UNIPROXY_UNRESOLVED: unknown policy {other:?}, using block");
                UnresolvedPolicy::Block(timeout)
            },
        };

        if let Some(timeout) = string("UNIPROXY_DETACH_TIMEOUT_MS")
            .and_then(|value| parse_millis("UNIPROXY_DETACH_TIMEOUT_MS", &value))
        {
            config.detach_timeout = timeout;
        }

        match string("UNIPROXY_STRICT").as_deref() {
            None => {},
            Some("1" | "true") => config.strict = true,
            Some("0" | "false") => config.strict = false,
            Some(other) => warn!("UNIPROXY_STRICT: expected 0 or 1, got {other:?}"),
        }

        if let Some(filter) = string("UNIPROXY_LOG").filter(|f| !f.is_empty()) {
            config.log_filter = filter;
        }

        if let Some(path) = lookup("UNIPROXY_LOG_FILE").filter(|p| !p.is_empty()) {
            config.log_file = Some(PathBuf::from(path));
        }

        config
    }

    /// Set the explicit location of the genuine library.
    pub fn with_genuine_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.genuine_path = Some(path.into());
        self
    }

    /// Append a search directory.
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Set the unresolved call policy.
    pub fn with_unresolved(mut self, policy: UnresolvedPolicy) -> Self {
        self.unresolved = policy;
        self
    }

    /// Set the detach timeout.
    pub fn with_detach_timeout(mut self, timeout: Duration) -> Self {
        self.detach_timeout = timeout;
        self
    }

    /// Set strict surface checking.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set the log filter directives.
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Set the log file path.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

fn parse_millis(key: &str, value: &str) -> Option<Duration> {
    match value.trim().parse() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            warn!("{key}: {value:?} is not a number of milliseconds: {e}");
            None
        },
    }
}
