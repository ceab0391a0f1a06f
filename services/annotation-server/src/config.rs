use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::retry::{RetryPolicy, RetrySchedule};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchEngineKind {
    Memory,
    Elasticsearch { url: String, index_prefix: String },
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub search_engine: SearchEngineKind,

    pub job_workers: usize,
    pub job_retry: RetrySchedule,
    pub webhook_retry: RetrySchedule,
    pub webhook_timeout: Duration,
    pub serializable_retry: RetryPolicy,

    pub owner_username: Option<String>,
    pub owner_api_key: Option<String>,
    pub hostname: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| -> Result<String> {
            lookup(key).with_context(|| format!("Missing required env var: {key}"))
        };
        let or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let database_url = get("DATABASE_URL")?;
        let bind_addr = or("BIND_ADDR", "0.0.0.0:6900");

        let search_engine = match or("SEARCH_ENGINE", "memory").as_str() {
            "memory" => SearchEngineKind::Memory,
            "elasticsearch" | "opensearch" => {
                let url = get("ELASTICSEARCH_URL")?;
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    bail!("ELASTICSEARCH_URL must start with http:// or https://");
                }
                SearchEngineKind::Elasticsearch {
                    url,
                    index_prefix: or("ELASTICSEARCH_INDEX_PREFIX", "rg"),
                }
            }
            other => bail!("SEARCH_ENGINE must be `memory` or `elasticsearch`, got `{other}`"),
        };

        let job_workers: usize = or("JOB_WORKERS", "2")
            .parse()
            .context("JOB_WORKERS must be a positive integer")?;
        if job_workers == 0 {
            bail!("JOB_WORKERS must be at least 1");
        }

        let job_retry = RetrySchedule::parse(&or("JOB_RETRY_INTERVALS", "5,30,120"))
            .context("invalid JOB_RETRY_INTERVALS")?;
        let webhook_retry = RetrySchedule::parse(&or("WEBHOOK_RETRY_INTERVALS", "10,60,180"))
            .context("invalid WEBHOOK_RETRY_INTERVALS")?;

        let webhook_timeout = Duration::from_secs(
            or("WEBHOOK_TIMEOUT_SECS", "20")
                .parse()
                .context("WEBHOOK_TIMEOUT_SECS must be an integer")?,
        );

        let max_elapsed = Duration::from_secs(
            or("SERIALIZABLE_MAX_RETRY_SECS", "15")
                .parse()
                .context("SERIALIZABLE_MAX_RETRY_SECS must be an integer")?,
        );
        let serializable_retry = RetryPolicy {
            max_elapsed,
            ..RetryPolicy::default()
        };

        let owner_username = lookup("OWNER_USERNAME");
        let owner_api_key = lookup("OWNER_API_KEY");
        if owner_username.is_some() != owner_api_key.is_some() {
            bail!("OWNER_USERNAME and OWNER_API_KEY must be set together");
        }

        let hostname = or("HOSTNAME", "annotation-server");

        Ok(Self {
            database_url,
            bind_addr,
            search_engine,
            job_workers,
            job_retry,
            webhook_retry,
            webhook_timeout,
            serializable_retry,
            owner_username,
            owner_api_key,
            hostname,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[("DATABASE_URL", "postgres://localhost/annotations")]).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:6900");
        assert_eq!(cfg.search_engine, SearchEngineKind::Memory);
        assert_eq!(cfg.job_workers, 2);
        assert_eq!(cfg.webhook_retry.max_attempts(), 4);
        assert_eq!(cfg.webhook_retry.delay_after(1), Some(Duration::from_secs(10)));
        assert_eq!(cfg.webhook_timeout, Duration::from_secs(20));
        assert_eq!(cfg.serializable_retry.max_elapsed, Duration::from_secs(15));
        assert!(cfg.owner_username.is_none());
    }

    #[test]
    fn database_url_is_required() {
        let err = config(&[]).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn elasticsearch_needs_url() {
        assert!(config(&[("DATABASE_URL", "postgres://x"), ("SEARCH_ENGINE", "elasticsearch")]).is_err());

        let cfg = config(&[
            ("DATABASE_URL", "postgres://x"),
            ("SEARCH_ENGINE", "elasticsearch"),
            ("ELASTICSEARCH_URL", "http://es:9200"),
        ])
        .unwrap();
        assert_eq!(
            cfg.search_engine,
            SearchEngineKind::Elasticsearch {
                url: "http://es:9200".into(),
                index_prefix: "rg".into()
            }
        );

        assert!(config(&[("DATABASE_URL", "postgres://x"), ("SEARCH_ENGINE", "solr")]).is_err());
    }

    #[test]
    fn owner_bootstrap_needs_both_values() {
        assert!(config(&[("DATABASE_URL", "postgres://x"), ("OWNER_USERNAME", "owner")]).is_err());
        let cfg = config(&[
            ("DATABASE_URL", "postgres://x"),
            ("OWNER_USERNAME", "owner"),
            ("OWNER_API_KEY", "secret"),
        ])
        .unwrap();
        assert_eq!(cfg.owner_username.as_deref(), Some("owner"));
    }

    #[test]
    fn bad_numbers_fail_fast() {
        assert!(config(&[("DATABASE_URL", "postgres://x"), ("JOB_WORKERS", "0")]).is_err());
        assert!(config(&[("DATABASE_URL", "postgres://x"), ("WEBHOOK_RETRY_INTERVALS", "10,abc")]).is_err());
    }
}
