use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use kaleido_core::error::CoreError;
use kaleido_core::report::ProtocolVersion;
use kaleido_core::scope::{self, PlotlyOptions, ScopeRegistry};

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Browser-level DevTools WebSocket URL.
    pub devtools_url: String,
    /// Tabs opened at startup.
    pub tabs: usize,
    /// URL every new tab opens.
    pub page_url: String,
    /// Per-job deadline; `None` when disabled.
    pub job_timeout: Option<Duration>,
    /// Connection attempts before giving up on the browser.
    pub connect_attempts: u32,
    pub protocol: ProtocolVersion,
    /// Scope used when a request names none.
    pub default_scope: String,
    pub plotly: PlotlyOptions,
    pub mermaid_scripts: Vec<PathBuf>,
    /// Submit an internal warm-up job at startup.
    pub warm_up: bool,
    pub log_json: bool,
    /// Reported in every legacy output line.
    pub version: String,
}

/// Errors raised while reading the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                    | Default       |
    /// |----------------------------|---------------|
    /// | `KALEIDO_DEVTOOLS_URL`     | required      |
    /// | `KALEIDO_TABS`             | `1`           |
    /// | `KALEIDO_PAGE_URL`         | `about:blank` |
    /// | `KALEIDO_JOB_TIMEOUT_SECS` | `90` (`0` disables) |
    /// | `KALEIDO_CONNECT_ATTEMPTS` | `10`          |
    /// | `KALEIDO_PROTOCOL`         | `modern`      |
    /// | `KALEIDO_DEFAULT_SCOPE`    | `plotly`      |
    /// | `KALEIDO_PLOTLY_SCRIPTS`   | empty         |
    /// | `KALEIDO_MERMAID_SCRIPTS`  | empty         |
    /// | `KALEIDO_MAPBOX_TOKEN`     | unset         |
    /// | `KALEIDO_TOPOJSON`         | unset         |
    /// | `KALEIDO_WARM_UP`          | `false`       |
    /// | `KALEIDO_LOG_JSON`         | `false`       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `get`, which returns a variable's value
    /// if it is set.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let devtools_url = non_empty(&get, "KALEIDO_DEVTOOLS_URL")
            .ok_or(ConfigError::Missing("KALEIDO_DEVTOOLS_URL"))?;
        if !(devtools_url.starts_with("ws://") || devtools_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                var: "KALEIDO_DEVTOOLS_URL",
                value: devtools_url,
                reason: "expected a ws:// or wss:// URL".into(),
            });
        }

        let timeout_secs: u64 = parsed(&get, "KALEIDO_JOB_TIMEOUT_SECS", 90)?;
        let job_timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));

        let connect_attempts: u32 = parsed(&get, "KALEIDO_CONNECT_ATTEMPTS", 10)?;
        if connect_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "KALEIDO_CONNECT_ATTEMPTS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            devtools_url,
            tabs: parsed(&get, "KALEIDO_TABS", 1)?,
            page_url: non_empty(&get, "KALEIDO_PAGE_URL").unwrap_or_else(|| "about:blank".into()),
            job_timeout,
            connect_attempts,
            protocol: parsed(&get, "KALEIDO_PROTOCOL", ProtocolVersion::Modern)?,
            default_scope: non_empty(&get, "KALEIDO_DEFAULT_SCOPE")
                .unwrap_or_else(|| scope::PLOTLY.into()),
            plotly: PlotlyOptions {
                scripts: path_list(&get, "KALEIDO_PLOTLY_SCRIPTS"),
                mapbox_token: non_empty(&get, "KALEIDO_MAPBOX_TOKEN"),
                topojson: non_empty(&get, "KALEIDO_TOPOJSON"),
            },
            mermaid_scripts: path_list(&get, "KALEIDO_MERMAID_SCRIPTS"),
            warm_up: flag(&get, "KALEIDO_WARM_UP")?,
            log_json: flag(&get, "KALEIDO_LOG_JSON")?,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Build the built-in scopes from the configured scripts.
    pub fn scope_registry(&self) -> Result<ScopeRegistry, CoreError> {
        let mut registry = ScopeRegistry::new();
        registry.insert(scope::plotly(&self.plotly)?);
        registry.insert(scope::mermaid(&self.mermaid_scripts)?);
        Ok(registry)
    }
}

fn non_empty(get: &impl Fn(&str) -> Option<String>, var: &str) -> Option<String> {
    get(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match non_empty(get, var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn flag(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<bool, ConfigError> {
    let Some(value) = non_empty(get, var) else {
        return Ok(false);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value,
            reason: "expected true or false".into(),
        }),
    }
}

fn path_list(get: &impl Fn(&str) -> Option<String>, var: &str) -> Vec<PathBuf> {
    non_empty(get, var)
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}
