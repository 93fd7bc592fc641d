use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use grantflow_adapters::SearchQuery;
use grantflow_storage::{BackoffPolicy, BackoffPolicyError, HttpClientConfig, TokenBucketConfig};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{prefix} backoff policy: {source}")]
    Backoff {
        prefix: &'static str,
        #[source]
        source: BackoffPolicyError,
    },
}

/// Validated runtime settings; the only way to build a [`crate::Pipeline`].
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub api_base_url: String,
    pub database_url: String,
    pub api_key: Option<String>,
    pub archive_dir: PathBuf,
    pub queries_path: PathBuf,
    pub discovery_cron: String,
    pub worker_count: usize,
    pub http_timeout: Duration,
    pub request_interval: Duration,
    pub max_pages: u32,
    pub page_rows: u32,
    pub visibility_timeout: Duration,
    pub fetch_backoff: BackoffPolicy,
    pub commit_backoff: BackoffPolicy,
    pub forbidden_is_rate_limit: bool,
    pub user_agent: String,
    pub web_port: u16,
}

pub fn default_commit_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial_delay: Duration::from_millis(200),
        multiplier: 2.0,
        max_attempts: 4,
        jitter_fraction: 0.2,
        max_delay: Duration::from_secs(10),
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &'static str) -> Option<String> {
        (self.lookup)(var).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing(var))
    }

    fn parsed<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(var) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var,
                    value: raw,
                    reason: "expected true or false".into(),
                }),
            },
        }
    }

    fn at_least<T>(&self, var: &'static str, default: T, min: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr + PartialOrd + Copy + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        let value = self.parsed(var, default)?;
        if value < min {
            return Err(ConfigError::Invalid {
                var,
                value: value.to_string(),
                reason: format!("must be at least {min}"),
            });
        }
        Ok(value)
    }

    fn backoff(
        &self,
        prefix: &'static str,
        vars: [&'static str; 4],
        defaults: BackoffPolicy,
    ) -> Result<BackoffPolicy, ConfigError> {
        let [initial_ms, multiplier, max_attempts, jitter] = vars;
        let initial_delay = Duration::from_millis(
            self.parsed(initial_ms, defaults.initial_delay.as_millis() as u64)?,
        );
        let policy = BackoffPolicy {
            initial_delay,
            multiplier: self.parsed(multiplier, defaults.multiplier)?,
            max_attempts: self.parsed(max_attempts, defaults.max_attempts)?,
            jitter_fraction: self.parsed(jitter, defaults.jitter_fraction)?,
            max_delay: defaults.max_delay.max(initial_delay),
        };
        policy
            .validate()
            .map_err(|source| ConfigError::Backoff { prefix, source })?;
        Ok(policy)
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`IngestConfig::from_env`] but reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let api_base_url = vars.required("GRANTS_API_BASE_URL")?;
        if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                var: "GRANTS_API_BASE_URL",
                value: api_base_url,
                reason: "must be an http(s) URL".into(),
            });
        }
        let database_url = vars.required("DATABASE_URL")?;

        Ok(Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            database_url,
            api_key: vars.get("GRANTS_API_KEY"),
            archive_dir: vars
                .get("GRANTFLOW_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./archive")),
            queries_path: vars
                .get("GRANTFLOW_QUERIES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./queries.yaml")),
            discovery_cron: vars
                .get("GRANTFLOW_DISCOVERY_CRON")
                .unwrap_or_else(|| "0 0 */6 * * *".to_string()),
            worker_count: vars.at_least("GRANTFLOW_WORKERS", 4usize, 1)?,
            http_timeout: Duration::from_secs(vars.at_least(
                "GRANTFLOW_HTTP_TIMEOUT_SECS",
                30u64,
                1,
            )?),
            request_interval: Duration::from_millis(vars.parsed(
                "GRANTFLOW_REQUEST_INTERVAL_MS",
                250u64,
            )?),
            max_pages: vars.at_least("GRANTFLOW_MAX_PAGES", 20u32, 1)?,
            page_rows: vars.at_least("GRANTFLOW_PAGE_ROWS", 25u32, 1)?,
            visibility_timeout: Duration::from_secs(vars.at_least(
                "GRANTFLOW_VISIBILITY_TIMEOUT_SECS",
                300u64,
                1,
            )?),
            fetch_backoff: vars.backoff(
                "fetch",
                [
                    "GRANTFLOW_FETCH_INITIAL_DELAY_MS",
                    "GRANTFLOW_FETCH_MULTIPLIER",
                    "GRANTFLOW_FETCH_MAX_ATTEMPTS",
                    "GRANTFLOW_FETCH_JITTER",
                ],
                BackoffPolicy::default(),
            )?,
            commit_backoff: vars.backoff(
                "commit",
                [
                    "GRANTFLOW_COMMIT_INITIAL_DELAY_MS",
                    "GRANTFLOW_COMMIT_MULTIPLIER",
                    "GRANTFLOW_COMMIT_MAX_ATTEMPTS",
                    "GRANTFLOW_COMMIT_JITTER",
                ],
                default_commit_backoff(),
            )?,
            forbidden_is_rate_limit: vars.flag("GRANTFLOW_FORBIDDEN_IS_RATE_LIMIT", true)?,
            user_agent: vars
                .get("GRANTFLOW_USER_AGENT")
                .unwrap_or_else(|| format!("grantflow/{}", env!("CARGO_PKG_VERSION"))),
            web_port: vars.parsed("GRANTFLOW_WEB_PORT", 8000u16)?,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            api_key: self.api_key.clone(),
            backoff: self.fetch_backoff,
            token_bucket: (!self.request_interval.is_zero()).then_some(TokenBucketConfig {
                capacity: 1,
                refill_every: self.request_interval,
            }),
            forbidden_is_rate_limit: self.forbidden_is_rate_limit,
            global_concurrency: self.worker_count.max(1) * 2,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryFile {
    queries: Vec<SearchQuery>,
}

/// Reads the discovery strategies; a missing file means one unfiltered query.
pub fn load_queries(path: &Path) -> anyhow::Result<Vec<SearchQuery>> {
    if !path.exists() {
        return Ok(vec![SearchQuery::named("all")]);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: QueryFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if file.queries.is_empty() {
        anyhow::bail!("{} lists no queries", path.display());
    }
    Ok(file.queries)
}
